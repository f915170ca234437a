/// Build a configuration object from layered sources.
/// Later sources take precedence: embedded defaults, then the config file (when it exists), then
/// `<env_prefix>__SECTION__KEY` environment variables, then explicit `section.key` overrides.
pub fn load_config<T>(
    default_json: Option<&str>,
    overrides_config_fpath: Option<&str>,
    overrides: Option<Vec<(String, String)>>,
    env_prefix: &str,
) -> anyhow::Result<T>
where
    T: for<'a> serde::Deserialize<'a>,
{
    let mut builder = config::Config::builder();
    if let Some(default_json) = default_json {
        builder = builder.add_source(config::File::from_str(default_json, config::FileFormat::Json));
    }
    if let Some(config_fpath) = overrides_config_fpath {
        if std::path::Path::new(&config_fpath).exists() {
            builder = builder.add_source(config::File::with_name(config_fpath));
        } else {
            anyhow::bail!("Configuration file '{}' does not exist", config_fpath);
        }
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .try_parsing(true)
            .separator("__")
            .prefix_separator("__"),
    );
    if let Some(overrides) = overrides {
        for (k, v) in overrides {
            builder = match builder.set_override(&k, v.clone()) {
                Ok(s) => s,
                Err(e) => {
                    anyhow::bail!("Failed to set override '{}' to '{}' because {}", k, v, e)
                },
            };
        }
    }
    match builder.build() {
        Ok(s) => match s.try_deserialize() {
            Ok(cfg) => Ok(cfg),
            Err(e) => anyhow::bail!("Failed to deserialize configuration because '{}'", e),
        },
        Err(e) => anyhow::bail!("Failed to build configuration because '{}'", e),
    }
}
