//! Process configuration captured from the environment.
//!
//! containerd describes the stream through environment variables. They are
//! read exactly once, when the process starts, into [`ProcessConfig`]; nothing
//! else in the crate reads the environment. Tests build a config from a
//! lookup closure instead of mutating the real process environment.

use crate::channel::ChannelHandle;
use crate::constants::{
    CRITICAL_ENV, ENV_LOG_FILTER, ENV_MEDIA_TYPE, ENV_PAYLOAD_PIPE, ENV_SEARCH_PATH,
};

/// Typed view of the stream processor's environment contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Media type of the stream on stdin.
    pub media_type: Option<String>,
    /// Address of the options payload channel.
    pub payload_pipe: Option<ChannelHandle>,
    /// Other allow-listed variables forwarded to the restricted child.
    pub passthrough: Vec<(String, String)>,
}

impl ProcessConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let passthrough = [ENV_LOG_FILTER, ENV_SEARCH_PATH]
            .into_iter()
            .chain(CRITICAL_ENV.iter().copied())
            .filter_map(|name| get(name).map(|v| (name.to_string(), v)))
            .collect();

        Self {
            media_type: get(ENV_MEDIA_TYPE),
            payload_pipe: get(ENV_PAYLOAD_PIPE).map(ChannelHandle::new),
            passthrough,
        }
    }

    /// Returns the variables to set in the restricted child.
    ///
    /// This is the complete child environment; the parent's environment is
    /// never inherited.
    pub fn forwarded_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(2 + self.passthrough.len());
        if let Some(media_type) = &self.media_type {
            env.push((ENV_MEDIA_TYPE.to_string(), media_type.clone()));
        }
        if let Some(pipe) = &self.payload_pipe {
            env.push((ENV_PAYLOAD_PIPE.to_string(), pipe.address().to_string()));
        }
        env.extend(self.passthrough.iter().cloned());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = ProcessConfig::from_lookup(lookup(&[(ENV_PAYLOAD_PIPE, "")]));
        assert!(config.payload_pipe.is_none());
    }

    #[test]
    fn test_unrelated_variables_not_forwarded() {
        let config = ProcessConfig::from_lookup(lookup(&[
            (ENV_MEDIA_TYPE, "application/vnd.oci.image.layer.v1.tar"),
            ("AWS_SECRET_ACCESS_KEY", "hunter2"),
        ]));
        let env = config.forwarded_env();
        assert_eq!(env.len(), 1);
        assert!(env.iter().all(|(k, _)| k != "AWS_SECRET_ACCESS_KEY"));
    }
}
