use guid_create::GUID;

pub type TransactionId = String;

pub fn gen_tid() -> TransactionId {
    GUID::rand().to_string().to_lowercase().replace('-', "")
}

lazy_static::lazy_static! {
  pub static ref STARTUP_TID: TransactionId = "Startup".to_string();
  pub static ref TEST_TID: TransactionId = "TestTest".to_string();
  pub static ref MONITOR_TID: TransactionId = "ErgMonitor".to_string();
  pub static ref COORDINATOR_TID: TransactionId = "SensorCoordinator".to_string();
  pub static ref SAMPLER_TID: TransactionId = "SamplingWorker".to_string();
  pub static ref PROCESSING_TID: TransactionId = "MetricProcessing".to_string();
  pub static ref STORAGE_TID: TransactionId = "AppStorage".to_string();
}
