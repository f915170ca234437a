#[macro_export]
/// A helper macro to get the last item in the [crate::bail_error] macro, which will be the error message.
macro_rules! last {
  ([$single:tt] $($rest:tt)*) => {
    $single // base case
  };
  ([$first:tt $($rest:tt)*] $($reversed:tt)*) => {
    $crate::last!([$($rest)*] $first $($reversed)*)  // recursion
  };
}

#[macro_export]
/// A helper macro to log an error with details, then raise the message as an error
///
/// # Example
/// ```
/// use erg_library::bail_error;
///
/// fn fails() -> anyhow::Result<()> {
///   let tid = "test".to_string();
///   bail_error!(tid=tid, "No sensors could be resolved");
/// }
/// assert_eq!(fails().err().unwrap().to_string(), "No sensors could be resolved");
/// ```
macro_rules! bail_error {
  ($($arg:tt)+) => {
    {
      tracing::error!($($arg)+);
      anyhow::bail!($crate::last!([$($arg)+]))
    }
  };
}

#[macro_export]
/// Log a typed error with details, then return it wrapped in [anyhow::Error].
/// The typed value stays recoverable with [anyhow::Error::downcast_ref].
///
/// # Example
/// ```
/// use erg_library::{bail_typed, errors::ScriptError};
///
/// fn fails() -> anyhow::Result<()> {
///   let tid = "test".to_string();
///   bail_typed!(ScriptError { message: "boom".to_string() }, tid=tid, "Application raised");
/// }
/// assert!(fails().err().unwrap().downcast_ref::<ScriptError>().is_some());
/// ```
macro_rules! bail_typed {
  ($err:expr, $($arg:tt)+) => {
    {
      let err = $err;
      tracing::error!(error=%err, $($arg)+);
      return Err(anyhow::Error::new(err));
    }
  };
}

#[macro_export]
/// A macro to enable injecting compile-time configuration that will be used at load time.
/// Will still load from file and environment that override the defaults.
///
/// # Example
/// ```ignore
/// pub fn new(
///     config_fpath: Option<&str>,
///     overrides: Option<Vec<(String, String)>>,
/// ) -> anyhow::Result<Configuration> {
///     erg_library::load_config_default!("erg_library/src/erg.json", config_fpath, overrides, "ERG")
/// }
/// ```
macro_rules! load_config_default {
    ($defaults_json_file:literal, $overrides_config_fpath:ident, $overrides:ident, $env_prefix:expr) => {{
        let defaults = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../", $defaults_json_file));
        $crate::config::load_config(Some(defaults), $overrides_config_fpath, $overrides, $env_prefix)
    }};
}
