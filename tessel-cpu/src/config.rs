use crate::{utils::parse_u64_with_prefix, ClusterId};

/// Cranelift optimization levels accepted by [Config::opt_level].
const OPT_LEVELS: &[&str] = &["none", "speed", "speed_and_size"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error parsing `{name}`: invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("`{name}` must be at least 1")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The maximum number of guest instructions in a single translation unit.
    pub max_unit_instructions: u32,
    pub core_id: u32,
    pub cluster_id: ClusterId,

    /// Call the debugger before every instruction.
    pub debugging: bool,

    /// Keep the IL of the last compiled unit.
    pub dump_il: bool,

    /// Check the instruction budget at every instruction boundary instead of only between
    /// units.
    pub precise_instruction_limit: bool,

    pub enable_verifier: bool,
    pub opt_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_unit_instructions: 128,
            core_id: 0,
            cluster_id: 0,
            debugging: false,
            dump_il: false,
            precise_instruction_limit: true,
            enable_verifier: false,
            opt_level: "speed_and_size".into(),
        }
    }
}

impl Config {
    /// Loads the default configuration with overrides from `TESSEL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [Config::from_env], reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let number = |name: &'static str| -> Result<Option<u32>, ConfigError> {
            let Some(value) = var(name)
            else {
                return Ok(None);
            };
            match parse_u64_with_prefix(&value).and_then(|x| u32::try_from(x).ok()) {
                Some(x) => Ok(Some(x)),
                None => Err(ConfigError::InvalidValue { name, value }),
            }
        };

        if let Some(count) = number("TESSEL_MAX_UNIT_INSTRUCTIONS")? {
            if count == 0 {
                return Err(ConfigError::Zero { name: "TESSEL_MAX_UNIT_INSTRUCTIONS" });
            }
            config.max_unit_instructions = count;
        }
        if let Some(id) = number("TESSEL_CORE_ID")? {
            config.core_id = id;
        }
        if let Some(id) = number("TESSEL_CLUSTER_ID")? {
            config.cluster_id = id;
        }

        config.debugging = var("TESSEL_DEBUG").is_some();
        config.dump_il = var("TESSEL_DUMP_IL").is_some();
        config.precise_instruction_limit = var("TESSEL_IMPRECISE_LIMIT").is_none();
        config.enable_verifier = var("TESSEL_ENABLE_JIT_VERIFIER").is_some();

        if let Some(level) = var("TESSEL_OPT_LEVEL") {
            if !OPT_LEVELS.contains(&level.as_str()) {
                return Err(ConfigError::InvalidValue { name: "TESSEL_OPT_LEVEL", value: level });
            }
            config.opt_level = level;
        }

        Ok(config)
    }
}
