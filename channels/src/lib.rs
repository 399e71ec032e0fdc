//! Ad channel catalogues.
//!
//! Each channel maps the actions it supports onto data-driven
//! [`StandardAction`](adrule_core::action::StandardAction)s and describes
//! how its reports are shaped. Wire clients are supplied by the caller as a
//! [`ChannelApi`].

pub mod apple_search_ads;
pub mod google_ads;
pub mod snapchat;

pub use apple_search_ads::AppleSearchAds;
pub use google_ads::GoogleAds;
pub use snapchat::Snapchat;

use adrule_core::channel::{Channel, ChannelApi};
use adrule_core::error::RuleError;
use adrule_core::reporter::RetryPolicy;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

pub const CHANNELS: [&str; 3] = [
    apple_search_ads::IDENTIFIER,
    google_ads::IDENTIFIER,
    snapchat::IDENTIFIER,
];

/// Build the channel registered under `identifier`.
pub fn channel_factory(identifier: &str, api: Arc<dyn ChannelApi>, retry: RetryPolicy) -> Result<Arc<dyn Channel>> {
    let channel: Arc<dyn Channel> = match identifier {
        apple_search_ads::IDENTIFIER => Arc::new(AppleSearchAds::new(api).with_retry(retry)),
        google_ads::IDENTIFIER => Arc::new(GoogleAds::new(api).with_retry(retry)),
        snapchat::IDENTIFIER => Arc::new(Snapchat::new(api).with_retry(retry)),
        other => return Err(RuleError::UnknownChannel(other.to_string()).into()),
    };
    debug!(channel = identifier, attempts = retry.attempts, "Channel built");
    Ok(channel)
}

/// Multiplier for a scaling action, rejecting non-scaling kinds.
pub(crate) fn multiplier(kind: adrule_core::ActionKind, percent: f64, channel: &str) -> Result<f64> {
    kind.multiplier(percent)
        .ok_or_else(|| adrule_core::channel::unsupported_action(kind, channel))
}
