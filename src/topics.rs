//! MQTT topic naming for one device.
//!
//! ```rust
//! use turbine_sync::config::Config;
//! use turbine_sync::device::PublishMode;
//! use turbine_sync::topics::{InboundTopic, Topics};
//!
//! let topics = Topics::new(&Config::default().with_thing_name("t1").identity());
//!
//! assert_eq!(topics.telemetry(PublishMode::Normal), "dt/windfarm/turbine/t1");
//! assert_eq!(topics.telemetry(PublishMode::Faster), "dt/windfarm/turbine/t1/faster");
//! assert_eq!(topics.telemetry(PublishMode::Cheaper), "$aws/rules/EnrichWithShadow");
//! assert_eq!(
//!     topics.classify("cmd/windfarm/turbine/t1/brake"),
//!     InboundTopic::Command("brake".into())
//! );
//! ```

use crate::device::PublishMode;

/// Rule-ingestion topic used in Cheaper mode.
pub const BASIC_INGEST_TOPIC: &str = "$aws/rules/EnrichWithShadow";

/// Who this device is, as far as topics and telemetry are concerned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Registered thing name.
    pub thing_name: String,
    /// Device ID reported in telemetry.
    pub device_id: String,
    /// Group segment (`windfarm`).
    pub group: String,
    /// Device-class segment (`turbine`).
    pub device_class: String,
}

/// Classification of an inbound topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundTopic {
    /// `.../shadow/update/delta`.
    ShadowDelta,
    /// `.../shadow/update/accepted`.
    ShadowAccepted,
    /// `.../shadow/update/rejected`.
    ShadowRejected,
    /// `cmd/<group>/<class>/<thing>/<suffix>`.
    Command(String),
    /// Anything else.
    Unknown,
}

/// Precomputed topic strings for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    shadow_update: String,
    shadow_delta: String,
    shadow_accepted: String,
    shadow_rejected: String,
    command_prefix: String,
    command_wildcard: String,
    telemetry: String,
    telemetry_faster: String,
}

impl Topics {
    /// Build every topic for `identity`.
    pub fn new(identity: &DeviceIdentity) -> Self {
        let shadow = format!("$aws/things/{}/shadow/update", identity.thing_name);
        let command_prefix = format!(
            "cmd/{}/{}/{}/",
            identity.group, identity.device_class, identity.thing_name
        );
        let telemetry = format!(
            "dt/{}/{}/{}",
            identity.group, identity.device_class, identity.thing_name
        );
        Self {
            shadow_delta: format!("{shadow}/delta"),
            shadow_accepted: format!("{shadow}/accepted"),
            shadow_rejected: format!("{shadow}/rejected"),
            shadow_update: shadow,
            command_wildcard: format!("{command_prefix}#"),
            command_prefix,
            telemetry_faster: format!("{telemetry}/faster"),
            telemetry,
        }
    }

    /// Outbound shadow updates.
    pub fn shadow_update(&self) -> &str {
        &self.shadow_update
    }

    /// Shadow deltas.
    pub fn shadow_delta(&self) -> &str {
        &self.shadow_delta
    }

    /// Accepted shadow updates.
    pub fn shadow_accepted(&self) -> &str {
        &self.shadow_accepted
    }

    /// Rejected shadow updates.
    pub fn shadow_rejected(&self) -> &str {
        &self.shadow_rejected
    }

    /// Device-scoped command wildcard.
    pub fn command_wildcard(&self) -> &str {
        &self.command_wildcard
    }

    /// Full command topic for `suffix`.
    pub fn command(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.command_prefix)
    }

    /// Every topic the device subscribes to.
    pub fn subscriptions(&self) -> [&str; 4] {
        [
            &self.shadow_delta,
            &self.shadow_accepted,
            &self.shadow_rejected,
            &self.command_wildcard,
        ]
    }

    /// Telemetry topic for `mode`.
    pub fn telemetry(&self, mode: PublishMode) -> &str {
        match mode {
            PublishMode::Normal => &self.telemetry,
            PublishMode::Faster => &self.telemetry_faster,
            PublishMode::Cheaper => BASIC_INGEST_TOPIC,
        }
    }

    /// Classify an inbound topic.
    pub fn classify(&self, topic: &str) -> InboundTopic {
        if topic == self.shadow_delta {
            InboundTopic::ShadowDelta
        } else if topic == self.shadow_accepted {
            InboundTopic::ShadowAccepted
        } else if topic == self.shadow_rejected {
            InboundTopic::ShadowRejected
        } else if let Some(suffix) = topic.strip_prefix(&self.command_prefix) {
            if suffix.is_empty() {
                InboundTopic::Unknown
            } else {
                InboundTopic::Command(suffix.to_string())
            }
        } else {
            InboundTopic::Unknown
        }
    }
}
