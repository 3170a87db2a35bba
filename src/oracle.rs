//! The feasibility oracle: the black box that reports what happens when an
//! option is added to a configuration.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::pool::{decode_pool, PoolError};
use crate::state::BaseState;

/// Effects reported by the oracle for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OracleReply {
    pub engine_added_options: Vec<String>,
    pub removed_options: Vec<String>,
    pub user_added_options: Vec<String>,
    pub feasible_options: Option<Value>,
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("cannot decode pooled reply: {0}")]
    Decode(#[from] PoolError),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// A source of feasibility answers.
///
/// Implementations may block; the probe engine calls them sequentially and
/// handles throttling itself.
pub trait Oracle {
    fn query(&mut self, option_added: &str, base: &BaseState) -> Result<OracleReply, OracleError>;
}

impl<O: Oracle + ?Sized> Oracle for &mut O {
    fn query(&mut self, option_added: &str, base: &BaseState) -> Result<OracleReply, OracleError> {
        (**self).query(option_added, base)
    }
}

/// Configuration for [`HttpOracle`].
#[derive(Debug, Clone)]
pub struct HttpOracleConfig {
    /// Endpoint URL, without query string.
    pub endpoint: String,
    /// Value of the `_routes` parameter; also the top-level key of the reply.
    pub route: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://configurator.porsche.com/zh-CN/mode/model/9921B2/feasibility-notification.data"
                .to_string(),
            route: "customer-feasibility".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpOracleConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Oracle backed by the configurator's feasibility endpoint.
///
/// Sends `GET <endpoint>?optionAdded=<id>&options=<a.b.c>&_routes=<route>`
/// and decodes the pooled reply.
pub struct HttpOracle {
    client: reqwest::blocking::Client,
    config: HttpOracleConfig,
}

impl HttpOracle {
    pub fn new(config: HttpOracleConfig) -> Result<Self, OracleError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }
}

impl Oracle for HttpOracle {
    fn query(&mut self, option_added: &str, base: &BaseState) -> Result<OracleReply, OracleError> {
        let options = base.signature();
        log::debug!("GET {} optionAdded={} ({} base options)", self.config.endpoint, option_added, base.len());

        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("optionAdded", option_added),
                ("options", options.as_str()),
                ("_routes", self.config.route.as_str()),
            ])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }

        let doc: Value = response.json()?;
        parse_reply(&doc, &self.config.route)
    }
}

/// Extracts the change set from a pooled feasibility reply.
///
/// Missing sections are read as empty; list entries without a string `id` are
/// ignored.
pub fn parse_reply(doc: &Value, route: &str) -> Result<OracleReply, OracleError> {
    let decoded = decode_pool(doc)?;
    let data = match decoded.get(route) {
        Some(section) => section.get("data").unwrap_or(&Value::Null),
        None if decoded.is_object() || decoded.is_null() => &Value::Null,
        None => return Err(OracleError::Malformed(format!("expected an object at the root, got {}", decoded))),
    };
    let change_set = data.get("changeSet").unwrap_or(&Value::Null);

    let ids = |key: &str| -> Vec<String> {
        change_set
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("id").and_then(Value::as_str))
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(OracleReply {
        engine_added_options: ids("engineAddedOptions"),
        removed_options: ids("removedOptions"),
        user_added_options: ids("userAddedOptions"),
        feasible_options: data.get("feasibleOptions").filter(|v| !v.is_null()).cloned(),
    })
}
