// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default {}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoaderConfig for T {}

/// A named example configuration, dumped alongside the default one so users
/// have a starting point for the less common setups.
pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Loads a configuration of type `T` by merging, in increasing precedence:
/// the type's `Default`, an optional TOML file, and `SKEIN__`-prefixed
/// environment variables (`__` separating nesting levels).
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
            phantom: PhantomData,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("SKEIN__").split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the configuration, or dumps the default (and example)
    /// configurations as TOML when the process was started with
    /// `--dump-config`. Returns `None` after dumping.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            self.dump_config();
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!("Failed to load config: {error}");
                    None
                }
            }
        }
    }

    fn dump_config(&self) {
        match toml::to_string(&T::default()) {
            Ok(rendered) => println!("# default configuration\n{rendered}"),
            Err(error) => eprintln!("Failed to render default config: {error}"),
        }
        if let Some(make_examples) = self.make_examples {
            for (name, example) in make_examples() {
                match toml::to_string(&example) {
                    Ok(rendered) => println!("# example: {name}\n{rendered}"),
                    Err(error) => eprintln!("Failed to render example {name}: {error}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;
    use test_r::test;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        count: u32,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                count: 4,
            }
        }
    }

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(Path::new("does/not/exist.toml"));
        let config = loader.load().unwrap();
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "count = 9").unwrap();
        let loader: ConfigLoader<TestConfig> = ConfigLoader::new(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.count, 9);
        assert_eq!(config.name, "default");
    }
}
