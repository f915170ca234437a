use clap::{command, Parser};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(short, long)]
    /// Sets a custom config file
    pub config: Option<String>,
    /// Number of measured rounds
    #[arg(short, long)]
    pub rounds: Option<u32>,
    /// Rounds to run before measuring, their results are discarded
    #[arg(short, long)]
    pub warmup_rounds: Option<u32>,
    /// Seconds between sensor samples
    #[arg(short, long)]
    pub sampling_period: Option<f64>,
    /// Name to store results under, defaults to the command's file name
    #[arg(short, long)]
    pub app_name: Option<String>,
    /// Directory results are stored in
    #[arg(short, long)]
    pub data_out: Option<String>,
    /// Minimum log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// The command to monitor, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}
impl Args {
    /// Config overrides for every flag that was passed.
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut out = vec![];
        if let Some(r) = self.rounds {
            out.push(("benchmarking.rounds".to_string(), r.to_string()));
        }
        if let Some(w) = self.warmup_rounds {
            out.push(("benchmarking.warmup_rounds".to_string(), w.to_string()));
        }
        if let Some(s) = self.sampling_period {
            out.push(("monitor.sampling_period_s".to_string(), s.to_string()));
        }
        if let Some(a) = &self.app_name {
            out.push(("output.app_name".to_string(), a.clone()));
        }
        if let Some(d) = &self.data_out {
            out.push(("output.data_out".to_string(), d.clone()));
        }
        if let Some(l) = &self.log_level {
            out.push(("logging.level".to_string(), l.clone()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_overrides() {
        let args = Args::parse_from(["erg", "-r", "3", "--data-out", "/tmp/out", "--", "sleep", "1"]);
        assert_eq!(
            args.overrides(),
            vec![
                ("benchmarking.rounds".to_string(), "3".to_string()),
                ("output.data_out".to_string(), "/tmp/out".to_string()),
            ]
        );
        assert_eq!(args.command, vec!["sleep", "1"]);
    }

    #[test]
    fn command_flags_are_not_parsed() {
        let args = Args::parse_from(["erg", "ls", "-l", "-a"]);
        assert!(args.overrides().is_empty());
        assert_eq!(args.command, vec!["ls", "-l", "-a"]);
    }
}
