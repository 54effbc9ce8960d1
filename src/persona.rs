//! Persona catalog and per-domain assignment
//!
//! A persona is a synthetic, internally consistent device identity. The
//! catalog is loaded once and never mutated; each domain gets one persona
//! for the life of the browsing session so a site always sees the same
//! device, while different sites see independent ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage key of the domain → persona-id map
const BINDINGS_KEY: &str = "persona:by-domain";
/// Prefix shared by every persona-related storage key
const KEY_PREFIX: &str = "persona:";

/// Screen geometry attributes of a persona
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenGeometry {
    pub width: u32,
    pub height: u32,
    pub avail_width: u32,
    pub avail_height: u32,
    pub color_depth: u32,
    pub pixel_depth: u32,
}

/// WebGL vendor/renderer pair a persona reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebglIdentity {
    pub vendor: String,
    pub renderer: String,
}

/// One synthetic device identity, immutable after catalog load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub os: String,
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub device_type: String,
    pub user_agent: String,
    pub screen: ScreenGeometry,
    #[serde(default = "default_pixel_ratio")]
    pub device_pixel_ratio: f64,
    pub timezone: String,
    pub language: String,
    #[serde(default)]
    pub languages: Vec<String>,
    pub webgl: WebglIdentity,
    pub hardware_concurrency: u32,
    pub platform: String,
}

fn default_pixel_ratio() -> f64 {
    1.0
}

/// The hard-coded persona substituted when the catalog cannot be used
pub fn fallback_persona() -> Persona {
    Persona {
        id: "fallback-windows-chrome".to_string(),
        name: "Fallback Windows Chrome".to_string(),
        os: "windows".to_string(),
        browser: "chrome".to_string(),
        device_type: "desktop".to_string(),
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            .to_string(),
        screen: ScreenGeometry {
            width: 1920,
            height: 1080,
            avail_width: 1920,
            avail_height: 1040,
            color_depth: 24,
            pixel_depth: 24,
        },
        device_pixel_ratio: 1.0,
        timezone: "America/New_York".to_string(),
        language: "en-US".to_string(),
        languages: vec!["en-US".to_string(), "en".to_string()],
        webgl: WebglIdentity {
            vendor: "Google Inc.".to_string(),
            renderer: "ANGLE (Intel, Intel(R) HD Graphics Direct3D11 vs_5_0 ps_5_0, D3D11)"
                .to_string(),
        },
        hardware_concurrency: 4,
        platform: "Win32".to_string(),
    }
}

/// Where the external catalog JSON comes from
pub trait CatalogSource: Send + Sync {
    fn fetch(&self) -> Result<String>;
}

/// Catalog shipped as a JSON file next to the installation
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CatalogSource for FileCatalog {
    fn fetch(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

/// In-memory, read-only persona catalog
#[derive(Debug, Clone)]
pub struct Catalog {
    personas: Vec<Persona>,
}

impl Catalog {
    /// Load and validate the external catalog. Never fails: any problem
    /// (unreachable source, bad JSON, invalid records) substitutes the
    /// single fallback persona so protection keeps working.
    pub fn load(source: &dyn CatalogSource) -> Self {
        match Self::try_load(source) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!("persona catalog unavailable, using fallback: {err}");
                Self {
                    personas: vec![fallback_persona()],
                }
            }
        }
    }

    /// Build a catalog from records already in memory (tests, embedders
    /// with their own loading); invalid input falls back the same way.
    pub fn from_json(json: &str) -> Self {
        struct Inline<'a>(&'a str);
        impl CatalogSource for Inline<'_> {
            fn fetch(&self) -> Result<String> {
                Ok(self.0.to_string())
            }
        }
        let source = Inline(json);
        match Self::try_load(&source) {
            Ok(catalog) => catalog,
            Err(err) => {
                tracing::warn!("inline persona catalog invalid, using fallback: {err}");
                Self {
                    personas: vec![fallback_persona()],
                }
            }
        }
    }

    fn try_load(source: &dyn CatalogSource) -> Result<Self> {
        let raw = source.fetch()?;
        let personas: Vec<Persona> =
            serde_json::from_str(&raw).map_err(|e| Error::catalog(e.to_string()))?;

        if personas.is_empty() {
            return Err(Error::catalog("catalog is empty"));
        }
        for persona in &personas {
            if persona.id.is_empty() || persona.user_agent.is_empty() {
                return Err(Error::catalog(format!(
                    "persona '{}' missing required fields",
                    persona.id
                )));
            }
            if persona.screen.width == 0 || persona.screen.height == 0 {
                return Err(Error::catalog(format!(
                    "persona '{}' has degenerate screen geometry",
                    persona.id
                )));
            }
        }

        tracing::debug!("loaded {} personas", personas.len());
        Ok(Self { personas })
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    /// Choose a persona uniformly at random, optionally filtered by OS.
    /// An OS filter matching nothing falls back to the full catalog.
    pub fn pick(&self, os_preference: Option<&str>) -> Persona {
        let filtered: Vec<&Persona> = match os_preference {
            Some(os) => {
                let os = os.to_lowercase();
                let matching: Vec<&Persona> =
                    self.personas.iter().filter(|p| p.os == os).collect();
                if matching.is_empty() {
                    self.personas.iter().collect()
                } else {
                    matching
                }
            }
            None => self.personas.iter().collect(),
        };

        let mut rng = rand::thread_rng();
        filtered
            .choose(&mut rng)
            .map(|p| (*p).clone())
            .unwrap_or_else(fallback_persona)
    }
}

/// Session-scoped shared storage behind the persona bindings.
///
/// Writes are not linearizable across contexts; concurrent first-binding
/// creation resolves last-write-wins.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// Plain in-memory store for single-process embeddings and tests
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }
}

/// Diagnostics snapshot of the persisted persona state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaStats {
    pub total_domains: usize,
    pub total_stored_personas: usize,
    pub domains: Vec<String>,
    pub persona_ids: Vec<String>,
}

/// Hands out and persists one persona per domain for the session
pub struct PersonaStore {
    catalog: Catalog,
    store: Arc<dyn SessionStore>,
}

impl PersonaStore {
    pub fn new(catalog: Catalog, store: Arc<dyn SessionStore>) -> Self {
        Self { catalog, store }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Strip scheme, leading `www.`, path and port from a domain-ish string
    pub fn normalize_domain(domain: &str) -> String {
        let mut host = domain.trim().to_lowercase();
        if let Some((_, rest)) = host.split_once("://") {
            host = rest.to_string();
        }
        if let Some(rest) = host.strip_prefix("www.") {
            host = rest.to_string();
        }
        if let Some((before_path, _)) = host.split_once('/') {
            host = before_path.to_string();
        }
        if let Some((before_port, _)) = host.split_once(':') {
            host = before_port.to_string();
        }
        host
    }

    /// The persona bound to `domain`, creating and persisting a binding on
    /// first request. Storage failures degrade to an ephemeral persona;
    /// this never fails.
    pub fn get_or_create_for_domain(&self, domain: &str, os_preference: Option<&str>) -> Persona {
        let normalized = Self::normalize_domain(domain);

        match self.lookup(&normalized) {
            Ok(Some(persona)) => {
                tracing::trace!("existing persona {} for {}", persona.id, normalized);
                return persona;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!("persona lookup failed for {normalized}: {err}");
                return self.catalog.pick(os_preference);
            }
        }

        let persona = self.catalog.pick(os_preference);
        if let Err(err) = self.persist(&normalized, &persona) {
            tracing::warn!("persona binding not persisted for {normalized}: {err}");
        } else {
            tracing::debug!("bound persona {} to {}", persona.id, normalized);
        }
        persona
    }

    fn lookup(&self, normalized: &str) -> Result<Option<Persona>> {
        let bindings = self.bindings()?;
        let Some(persona_id) = bindings.get(normalized) else {
            return Ok(None);
        };
        let Some(raw) = self.store.get(&persona_key(persona_id))? else {
            // Binding without a body: treat as unbound, rebind below
            return Ok(None);
        };
        let persona = serde_json::from_str(&raw)?;
        Ok(Some(persona))
    }

    fn persist(&self, normalized: &str, persona: &Persona) -> Result<()> {
        self.store
            .set(&persona_key(&persona.id), &serde_json::to_string(persona)?)?;

        // Read-modify-write on the shared map; a concurrent creator for
        // the same domain resolves last-write-wins
        let mut bindings = self.bindings()?;
        bindings.insert(normalized.to_string(), persona.id.clone());
        self.store
            .set(BINDINGS_KEY, &serde_json::to_string(&bindings)?)?;
        Ok(())
    }

    fn bindings(&self) -> Result<HashMap<String, String>> {
        match self.store.get(BINDINGS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashMap::new()),
        }
    }

    /// Remove all persona and binding state
    pub fn clear(&self) -> Result<()> {
        for key in self.store.keys()? {
            if key.starts_with(KEY_PREFIX) {
                self.store.remove(&key)?;
            }
        }
        Ok(())
    }

    /// Domain/persona counts for diagnostics
    pub fn stats(&self) -> PersonaStats {
        let bindings = self.bindings().unwrap_or_default();
        let persona_ids: Vec<String> = self
            .store
            .keys()
            .unwrap_or_default()
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX) && k != BINDINGS_KEY)
            .map(|k| k[KEY_PREFIX.len()..].to_string())
            .collect();

        let mut domains: Vec<String> = bindings.keys().cloned().collect();
        domains.sort();

        PersonaStats {
            total_domains: bindings.len(),
            total_stored_personas: persona_ids.len(),
            domains,
            persona_ids,
        }
    }
}

fn persona_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}
