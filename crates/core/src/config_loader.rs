use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

const BASE_FILE: &str = "config/Config.toml";
const ENV_PREFIX: &str = "STRATLAB_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from built-in defaults, `config/Config.toml`, and
    /// `STRATLAB_` environment variables, in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        Self::figment(None)
            .extract()
            .context("failed to load configuration")
    }

    /// Loads configuration with a profile file layered over the base file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::figment(Some(profile))
            .extract()
            .with_context(|| format!("failed to load configuration for profile `{profile}`"))
    }

    fn figment(profile: Option<&str>) -> Figment {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(BASE_FILE));
        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(format!("config/Config.{profile}.toml")));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_files() {
        Jail::expect_with(|_jail| {
            let config = ConfigLoader::load().expect("defaults should load");
            assert_eq!(config, AppConfig::default());
            assert_eq!(config.engine.max_variants, 100_000);
            Ok(())
        });
    }

    #[test]
    fn toml_then_profile_then_env() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/Config.toml",
                r#"
                [engine]
                max_variants = 500
                default_maxcpus = 2

                [database]
                url = "sqlite://base.db"
                "#,
            )?;
            jail.create_file(
                "config/Config.ci.toml",
                r#"
                [engine]
                default_maxcpus = 4
                "#,
            )?;
            jail.set_env("STRATLAB_DATABASE__URL", "sqlite::memory:");

            let config = ConfigLoader::load_with_profile("ci").expect("config should load");
            assert_eq!(config.engine.max_variants, 500);
            assert_eq!(config.engine.default_maxcpus, 4);
            assert_eq!(config.engine.stall_window_secs, 600);
            assert_eq!(config.database.url, "sqlite::memory:");
            Ok(())
        });
    }

    #[test]
    fn malformed_toml_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file("config/Config.toml", "[engine]\nmax_variants = \"many\"")?;
            assert!(ConfigLoader::load().is_err());
            Ok(())
        });
    }
}
