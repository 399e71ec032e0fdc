//! # AdRule
//!
//! Condition-driven campaign adjustments for ad channels.
//!
//! This crate ties the workspace together: the engine ([`engine`]), the channel
//! catalogues ([`channels`]) and the local storage and report adapters
//! ([`connectors`]).

pub use adrule_channels as channels;
pub use adrule_connectors as connectors;
pub use adrule_core as engine;

use adrule_core::channel::ChannelApi;
use adrule_core::config::EngineConfig;
use adrule_core::rule::RuleConnection;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub mod prelude {
    pub use adrule_channels::{channel_factory, AppleSearchAds, GoogleAds, Snapchat};
    pub use adrule_connectors::{ReportLoader, SledHistoryStore, SledMonitorStore};
    pub use adrule_core::config::AdruleConfig;
    pub use adrule_core::{
        adjust, Action, ActionKind, ActionResult, Channel, ChannelApi, Condition, ConditionGroup, GroupOperator, Kpi,
        Operator, Report, Rule, RuleConnection, RuleResult,
    };
}

/// Connect a channel to the sled stores named by the engine settings.
pub fn connect(engine: &EngineConfig, channel: &str, api: Arc<dyn ChannelApi>) -> Result<RuleConnection> {
    let channel = adrule_channels::channel_factory(channel, api, engine.retry_policy())?;
    let history = adrule_connectors::SledHistoryStore::new(&engine.history_path)?;
    let monitor = adrule_connectors::SledMonitorStore::new(&engine.monitor_path)?;
    info!(
        channel = channel.identifier(),
        history = %engine.history_path,
        monitor = %engine.monitor_path,
        "Rule connection opened"
    );
    Ok(RuleConnection {
        channel,
        history: Arc::new(history),
        monitor: Some(Arc::new(monitor)),
    })
}
