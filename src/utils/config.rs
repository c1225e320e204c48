use anyhow::{ anyhow, Context, Result };
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{ debug, error, warn };

const MAX_SECTIONS: usize = 100;
const MAX_ENTRIES_PER_SECTION: usize = 100;

pub type ConfigValue = String;
pub type ConfigSection = HashMap<String, ConfigValue>;

#[derive(Debug, Clone, Default)]
pub struct Config {
    sections: HashMap<String, ConfigSection>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            sections: HashMap::new(),
        }
    }

    pub fn set_value(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        if section.is_empty() || key.is_empty() {
            return Err(anyhow!("Section or key cannot be empty"));
        }

        if !self.sections.contains_key(section) && self.sections.len() >= MAX_SECTIONS {
            return Err(anyhow!("Maximum number of sections ({}) reached", MAX_SECTIONS));
        }

        let section_map = self.sections.entry(section.to_string()).or_default();

        if !section_map.contains_key(key) && section_map.len() >= MAX_ENTRIES_PER_SECTION {
            return Err(
                anyhow!(
                    "Maximum entries per section ({}) reached for section '{}'",
                    MAX_ENTRIES_PER_SECTION,
                    section
                )
            );
        }

        if key.contains("password") {
            debug!("Setting config: [{}] {} = ******", section, key);
        } else {
            debug!("Setting config: [{}] {} = {}", section, key, value);
        }
        section_map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|section_map| section_map.get(key))
            .map(|v| v.as_str())
    }

    pub fn get_int(&self, section: &str, key: &str, default: i32) -> i32 {
        match self.get_value(section, key) {
            Some(val) =>
                match val.parse::<i32>() {
                    Ok(num) => num,
                    Err(_) => {
                        warn!(
                            "Invalid integer value '{}' for {}.{}, using default {}",
                            val,
                            section,
                            key,
                            default
                        );
                        default
                    }
                }
            None => {
                debug!("Using default value {} for {}.{}", default, section, key);
                default
            }
        }
    }

    /// Like `get_int`, but for counts and sizes where zero or a negative
    /// value makes no sense.
    pub fn get_usize(&self, section: &str, key: &str, default: usize) -> usize {
        let fallback = i32::try_from(default).unwrap_or(i32::MAX);
        match self.get_int(section, key, fallback) {
            n if n > 0 => n as usize,
            n => {
                warn!("Non-positive value {} for {}.{}, using default {}", n, section, key, default);
                default
            }
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_value(section, key) {
            Some(val) => {
                let lower_val = val.to_lowercase();
                match lower_val.as_str() {
                    "1" | "true" | "yes" | "on" | "enabled" => true,
                    "0" | "false" | "no" | "off" | "disabled" => false,
                    _ => {
                        warn!(
                            "Invalid boolean value '{}' for {}.{}, using default {}",
                            val,
                            section,
                            key,
                            default
                        );
                        default
                    }
                }
            }
            None => {
                debug!("Using default value {} for {}.{}", default, section, key);
                default
            }
        }
    }

    pub fn is_section_exists(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Names of all sections that start with `prefix`, with the prefix
    /// stripped, sorted. `[account.alice]` yields `alice` for `account.`.
    pub fn sections_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self.sections
            .keys()
            .filter_map(|name| name.strip_prefix(prefix))
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }
}

pub struct ConfigLoader {
    config: Config,
    path: String,
}

impl ConfigLoader {
    pub fn new(path: String) -> Self {
        Self {
            config: Config::new(),
            path,
        }
    }

    pub async fn load(mut self) -> Result<ConfigLoader> {
        let binding = self.path.clone();
        let filepath = binding.trim();

        let config_path = Path::new(filepath);
        if !config_path.exists() {
            return Err(anyhow!("Config file does not exist: {}", filepath));
        }
        if !config_path.is_file() {
            return Err(anyhow!("Config path is not a regular file: {}", filepath));
        }

        let contents = fs
            ::read_to_string(config_path)
            .with_context(|| format!("Could not read config file {}", filepath))?;
        self.parse_config(&contents);

        Ok(self)
    }

    /// Builds a config from in-memory INI text.
    pub fn from_contents(contents: &str) -> Config {
        let mut loader = Self::new(String::new());
        loader.parse_config(contents);
        loader.config
    }

    fn parse_config(&mut self, contents: &str) {
        let mut current_section = String::new();

        for (index, line) in contents.lines().enumerate() {
            let line_number = index + 1;
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                let section = &trimmed[1..trimmed.len() - 1];
                current_section = section.trim().to_string();
                if current_section.is_empty() {
                    warn!("Empty section name at line {}", line_number);
                }
                continue;
            }

            if let Some(equals_pos) = trimmed.find('=') {
                let key = trimmed[..equals_pos].trim();
                let value = trimmed[equals_pos + 1..].trim();

                if key.is_empty() {
                    warn!("Empty key at line {}", line_number);
                    continue;
                }

                let value = Self::unquote_value(value);

                if current_section.is_empty() {
                    warn!("Key-value pair '{}' outside of section at line {}", key, line_number);
                    continue;
                }

                if let Err(e) = self.config.set_value(&current_section, key, &value) {
                    error!("Failed to set config value at line {}: {}", line_number, e);
                }
            } else {
                warn!("Invalid config line (no '=' found) at line {}: {}", line_number, trimmed);
            }
        }
    }

    fn unquote_value(value: &str) -> String {
        let trimmed = value.trim();
        let bytes = trimmed.as_bytes();

        if bytes.len() >= 2 {
            let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                return trimmed[1..trimmed.len() - 1].to_string();
            }
        }

        trimmed.to_string()
    }

    pub fn get_config(&self) -> &Config {
        &self.config
    }
}
