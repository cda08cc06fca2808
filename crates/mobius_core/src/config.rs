//! # Scene Configuration
//!
//! TOML description of a feedback shader, loaded once at startup.
//!
//! ```toml
//! vertex_source = "shaders/drift.vert"
//! particle_count = 4096
//! missing_input = "skip"
//!
//! [[streams]]
//! name = "position"
//! capture = "out_position"
//! components = 3
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FeedbackError, FeedbackResult};
use crate::stream::StreamDescriptor;

/// What a step does when the program has no input location for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingInputPolicy {
    /// Skip that stream's input bind, log it, count it, and still draw.
    #[default]
    Skip,
    /// Fail the step before touching GPU state.
    Reject,
}

/// Everything `FeedbackShader::setup` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Vertex-stage source of the feedback program.
    pub vertex_source: PathBuf,
    /// Elements per stream.
    pub particle_count: usize,
    /// Policy for streams the program does not read.
    #[serde(default)]
    pub missing_input: MissingInputPolicy,
    /// Streams in capture order.
    pub streams: Vec<StreamDescriptor>,
}

impl FeedbackConfig {
    /// Parses and validates a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError::Config`] on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> FeedbackResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| FeedbackError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file. A relative `vertex_source` resolves against the file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError::Config`] when the file cannot be read or is invalid.
    pub fn from_toml_file(path: impl AsRef<Path>) -> FeedbackResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FeedbackError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        if config.vertex_source.is_relative() {
            if let Some(dir) = path.parent() {
                config.vertex_source = dir.join(&config.vertex_source);
            }
        }
        Ok(config)
    }

    /// Checks the invariants `setup` asserts, as recoverable errors.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError::Config`] naming the first violation.
    pub fn validate(&self) -> FeedbackResult<()> {
        if self.particle_count == 0 {
            return Err(FeedbackError::Config("particle_count must be > 0".into()));
        }
        if self.streams.is_empty() {
            return Err(FeedbackError::Config("at least one stream is required".into()));
        }

        let mut names = HashSet::new();
        let mut captures = HashSet::new();
        for stream in &self.streams {
            if !stream.has_valid_width() {
                return Err(FeedbackError::Config(format!(
                    "stream '{}' has {} components, expected 1-4",
                    stream.name, stream.components
                )));
            }
            if !names.insert(stream.name.as_str()) {
                return Err(FeedbackError::Config(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
            if !captures.insert(stream.capture.as_str()) {
                return Err(FeedbackError::Config(format!(
                    "duplicate capture output '{}'",
                    stream.capture
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"
        vertex_source = "shaders/drift.vert"
        particle_count = 64

        [[streams]]
        name = "position"
        capture = "out_position"
        components = 3

        [[streams]]
        name = "age"
        capture = "out_age"
        components = 1
    "#;

    #[test]
    fn test_parse_scene() {
        let config = FeedbackConfig::from_toml_str(SCENE).unwrap();
        assert_eq!(config.particle_count, 64);
        assert_eq!(config.missing_input, MissingInputPolicy::Skip);
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[1], StreamDescriptor::new("age", "out_age", 1));
    }

    #[test]
    fn test_reject_policy() {
        let text = SCENE.replace("particle_count = 64", "particle_count = 64\nmissing_input = \"reject\"");
        let config = FeedbackConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.missing_input, MissingInputPolicy::Reject);
    }

    #[test]
    fn test_zero_count_rejected() {
        let text = SCENE.replace("particle_count = 64", "particle_count = 0");
        assert!(matches!(
            FeedbackConfig::from_toml_str(&text),
            Err(FeedbackError::Config(_))
        ));
    }

    #[test]
    fn test_bad_width_rejected() {
        let text = SCENE.replace("components = 1", "components = 0");
        let err = FeedbackConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("age"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let text = SCENE.replace("name = \"age\"", "name = \"position\"");
        let err = FeedbackConfig::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("duplicate stream name"));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(FeedbackConfig::from_toml_str("particle_count = [").is_err());
    }
}
