//! Injection coordination
//!
//! Gets the engine running in the page main world across the privilege
//! boundary. Strategies are tried strictly in order, each with its own
//! correlation id and timeout, and a strategy only counts as successful
//! once the engine's ACK comes back over the bridge. Exhausting the chain
//! fails open: mitigation stays inactive and the page keeps working.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bridge::{mint_id, Bridge};
use crate::domains::{effective_allow_list, effective_deny_list, hostname_of, should_protect};
use crate::engine::{wrap_source, Bootstrap};
use crate::error::{Error, Result};
use crate::persona::Persona;
use crate::{IframePolicy, ShroudConfig};

/// The wire action handled by the external privileged coordinator
pub const INJECT_ACTION: &str = "inject-main-world";

/// Privileged injection request handed to the host coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest {
    pub action: String,
    pub settings: ShroudConfig,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub correlation_id: String,
}

impl InjectRequest {
    pub fn new(
        settings: ShroudConfig,
        allow_list: Vec<String>,
        deny_list: Vec<String>,
        correlation_id: String,
    ) -> Self {
        Self {
            action: INJECT_ACTION.to_string(),
            settings,
            allow_list,
            deny_list,
            correlation_id,
        }
    }
}

/// External privileged coordinator: supplies settings and personas, and
/// can inject into the main world directly
pub trait PrivilegedHost: Send + Sync {
    fn settings(&self) -> Result<ShroudConfig>;
    fn persona_for_domain(&self, domain: &str, os_preference: Option<&str>) -> Result<Persona>;
    /// Must ultimately invoke the engine init entry point with the
    /// request's settings and lists in the target execution context
    fn inject_main_world(&self, request: InjectRequest) -> Result<()>;
}

/// The target execution context's script loaders
pub trait MainWorld: Send + Sync {
    /// Load wrapped engine source as a dynamically created script resource
    fn load_script_resource(&self, script: &str) -> Result<()>;
    /// Inject wrapped engine source as inline script content
    fn eval_inline(&self, script: &str) -> Result<()>;
}

/// Where the engine program text is fetched from
pub trait EngineSource: Send + Sync {
    fn fetch(&self) -> Result<String>;
}

/// Coordinator state machine. `Injected` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectState {
    NotInjected,
    Attempting(usize),
    Injected,
    Failed,
}

/// Identity of the frame the coordinator runs for
#[derive(Debug, Clone)]
pub struct PageContext {
    pub url: String,
    pub is_top: bool,
    /// `None` when the top frame is inaccessible (cross-origin)
    pub same_origin_as_top: Option<bool>,
}

impl PageContext {
    pub fn top(url: &str) -> Self {
        Self {
            url: url.to_string(),
            is_top: true,
            same_origin_as_top: Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Host,
    ScriptResource,
    Inline,
}

impl Strategy {
    const CHAIN: [Strategy; 3] = [Strategy::Host, Strategy::ScriptResource, Strategy::Inline];

    fn name(&self) -> &'static str {
        match self {
            Strategy::Host => "host-coordinator",
            Strategy::ScriptResource => "script-resource",
            Strategy::Inline => "inline-script",
        }
    }

    fn timeout_ms(&self) -> u64 {
        match self {
            Strategy::Host => 500,
            Strategy::ScriptResource => 500,
            Strategy::Inline => 300,
        }
    }
}

/// Drives the strategy chain for one page
pub struct InjectionCoordinator {
    bridge: Arc<Bridge>,
    host: Arc<dyn PrivilegedHost>,
    world: Arc<dyn MainWorld>,
    engine_source: Arc<dyn EngineSource>,
    state: Mutex<InjectState>,
}

impl InjectionCoordinator {
    pub fn new(
        bridge: Arc<Bridge>,
        host: Arc<dyn PrivilegedHost>,
        world: Arc<dyn MainWorld>,
        engine_source: Arc<dyn EngineSource>,
    ) -> Self {
        Self {
            bridge,
            host,
            world,
            engine_source,
            state: Mutex::new(InjectState::NotInjected),
        }
    }

    /// Current state
    pub fn state(&self) -> InjectState {
        *self.lock_state()
    }

    /// Run the chain for a page. Returns the terminal state; never
    /// returns an error, because every failure path degrades to the
    /// unprotected page.
    pub async fn run(&self, page: &PageContext) -> InjectState {
        // Re-entrancy guard: one successful injection per page
        if *self.lock_state() == InjectState::Injected {
            tracing::debug!("injection already completed, skipping");
            return InjectState::Injected;
        }

        let settings = self.host.settings().unwrap_or_else(|err| {
            tracing::warn!("settings unavailable, using defaults: {err}");
            ShroudConfig::default()
        });

        if !settings.enabled {
            tracing::debug!("protection disabled, not injecting");
            return InjectState::NotInjected;
        }
        if !self.frame_allowed(&settings, page) {
            return InjectState::NotInjected;
        }

        let hostname = hostname_of(&page.url);
        let allow_list = effective_allow_list(&settings.allow_patterns);
        let deny_list = effective_deny_list(&settings.deny_patterns);
        if !should_protect(&hostname, &allow_list, &deny_list, settings.preserve_auth) {
            tracing::debug!("{hostname} exempted by allow list");
            return InjectState::NotInjected;
        }

        let persona = match self
            .host
            .persona_for_domain(&hostname, settings.os_preference.as_deref())
        {
            Ok(persona) => Some(persona),
            Err(err) => {
                tracing::warn!("persona lookup failed, engine runs without one: {err}");
                None
            }
        };

        for (index, strategy) in Strategy::CHAIN.iter().enumerate() {
            *self.lock_state() = InjectState::Attempting(index);

            let correlation_id = mint_id();
            let waiter = self.bridge.expect_ack(&correlation_id);

            if let Err(err) = self.dispatch(
                *strategy,
                &settings,
                &allow_list,
                &deny_list,
                persona.clone(),
                &correlation_id,
            ) {
                tracing::debug!("strategy {} dispatch failed: {err}", strategy.name());
                continue;
            }

            if waiter
                .wait_on(&self.bridge, &correlation_id, strategy.timeout_ms())
                .await
            {
                tracing::debug!("strategy {} confirmed by engine", strategy.name());
                *self.lock_state() = InjectState::Injected;
                return InjectState::Injected;
            }

            let timeout = Error::InjectionTimeout {
                strategy: strategy.name(),
                correlation_id,
            };
            tracing::debug!("{timeout}, advancing");
        }

        tracing::warn!("all injection strategies exhausted, failing open");
        *self.lock_state() = InjectState::Failed;
        InjectState::Failed
    }

    fn dispatch(
        &self,
        strategy: Strategy,
        settings: &ShroudConfig,
        allow_list: &[String],
        deny_list: &[String],
        persona: Option<Persona>,
        correlation_id: &str,
    ) -> Result<()> {
        match strategy {
            Strategy::Host => self.host.inject_main_world(InjectRequest::new(
                settings.clone(),
                allow_list.to_vec(),
                deny_list.to_vec(),
                correlation_id.to_string(),
            )),
            Strategy::ScriptResource => {
                let script = self.wrapped_script(settings, allow_list, deny_list, persona, correlation_id)?;
                self.world.load_script_resource(&script)
            }
            Strategy::Inline => {
                let script = self.wrapped_script(settings, allow_list, deny_list, persona, correlation_id)?;
                self.world.eval_inline(&script)
            }
        }
    }

    fn wrapped_script(
        &self,
        settings: &ShroudConfig,
        allow_list: &[String],
        deny_list: &[String],
        persona: Option<Persona>,
        correlation_id: &str,
    ) -> Result<String> {
        let source = self.engine_source.fetch()?;
        wrap_source(
            &source,
            &Bootstrap {
                settings: settings.clone(),
                persona,
                allow_list: allow_list.to_vec(),
                deny_list: deny_list.to_vec(),
                correlation_id: correlation_id.to_string(),
            },
        )
    }

    fn frame_allowed(&self, settings: &ShroudConfig, page: &PageContext) -> bool {
        if page.is_top {
            return true;
        }
        match settings.protect_iframes {
            IframePolicy::All => true,
            IframePolicy::TopOnly => {
                tracing::debug!("skipping iframe under top-only policy");
                false
            }
            IframePolicy::SameOrigin => {
                let same = page.same_origin_as_top.unwrap_or(false);
                if !same {
                    tracing::debug!("skipping cross-origin iframe");
                }
                same
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, InjectState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
