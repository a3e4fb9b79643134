//! XEP-0092: Software Version.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;

use super::{send, IqHandler, Module, ModuleContext};
use crate::config::VersionConfig;
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "version";

const SOFTWARE_NAME: &str = "rookery";

/// Answers `jabber:iq:version` queries addressed to the server.
pub struct Version {
    ctx: ModuleContext,
    config: VersionConfig,
}

impl Version {
    /// Create the module.
    pub fn new(ctx: ModuleContext, config: VersionConfig) -> Arc<Self> {
        Arc::new(Self { ctx, config })
    }

    fn query(&self) -> Element {
        let text = |name: &str, value: &str| {
            Element::builder(name, ns::VERSION)
                .append(value.to_string())
                .build()
        };
        let mut query = Element::builder("query", ns::VERSION)
            .append(text("name", SOFTWARE_NAME))
            .append(text("version", env!("CARGO_PKG_VERSION")))
            .build();
        if self.config.show_os {
            let os = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
            query.append_child(text("os", &os));
        }
        query
    }
}

#[async_trait]
impl Module for Version {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::VERSION.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), XmppError> {
        Ok(())
    }

    fn iq_handler(self: Arc<Self>) -> Option<Arc<dyn IqHandler>> {
        Some(self)
    }
}

#[async_trait]
impl IqHandler for Version {
    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool {
        server_target && namespace == ns::VERSION
    }

    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        if !iq.is_iq_get() {
            return Err(XmppError::bad_request(None));
        }
        send(&self.ctx.router, iq.result_reply_with(self.query())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::*;

    fn version_iq(iq_type: &str) -> Stanza {
        iq(
            iq_type,
            "ortuman@localhost/yard",
            "localhost",
            Element::builder("query", ns::VERSION).build(),
        )
    }

    #[tokio::test]
    async fn test_reply_without_os() {
        let harness = Harness::new();
        let module = Version::new(harness.ctx.clone(), VersionConfig::default());
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module.process_iq(&version_iq("get")).await.unwrap();
        let reply = yard.drain().remove(0);
        let query = reply.child("query", ns::VERSION).unwrap();
        assert_eq!(query.get_child("name", ns::VERSION).unwrap().text(), "rookery");
        assert!(query.get_child("os", ns::VERSION).is_none());
    }

    #[tokio::test]
    async fn test_reply_with_os() {
        let harness = Harness::new();
        let module = Version::new(harness.ctx.clone(), VersionConfig { show_os: true });
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module.process_iq(&version_iq("get")).await.unwrap();
        let reply = yard.drain().remove(0);
        assert!(reply.child("query", ns::VERSION).unwrap().has_child("os", ns::VERSION));
    }

    #[tokio::test]
    async fn test_set_is_rejected() {
        let harness = Harness::new();
        let module = Version::new(harness.ctx.clone(), VersionConfig::default());
        assert!(module.process_iq(&version_iq("set")).await.is_err());
        assert!(!module.matches_namespace(ns::VERSION, false));
    }
}
