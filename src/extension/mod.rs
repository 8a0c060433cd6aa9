//! Plug-in services started and stopped alongside the relay.
//!
//! Extensions are resolved through an explicit registry mapping configured
//! type names to constructor functions, so a name in the configuration is
//! either registered at boot or a start-time error.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::service::ServiceBinding;

/// A plug-in started with the service binding and stopped on shutdown.
pub trait ExtensionService: Send {
    /// Name used in logs; conventionally the registered type name.
    fn name(&self) -> &str;

    fn start(&mut self, binding: &ServiceBinding) -> Result<()>;

    /// Must tolerate being called without a prior `start`.
    fn stop(&mut self);
}

/// Constructor for one extension type.
pub type ExtensionFactory = Box<dyn Fn() -> Box<dyn ExtensionService> + Send + Sync>;

/// Registry of constructable extension types, populated at boot.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, ExtensionFactory>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a type name, replacing any previous entry.
    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn ExtensionService> + Send + Sync + 'static,
    ) {
        if self
            .factories
            .insert(name.to_string(), Box::new(factory))
            .is_some()
        {
            warn!(name, "extension factory replaced");
        }
    }

    /// Instantiates the named extension, if registered.
    pub fn create(&self, name: &str) -> Option<Box<dyn ExtensionService>> {
        self.factories.get(name).map(|factory| factory())
    }
}

/// The set of extensions configured for one service instance.
///
/// Instantiates and starts the configured names in order; `stop` fans out to
/// every started extension and is idempotent. A second `start` warns and
/// does nothing.
#[derive(Default)]
pub struct ExtensionServices {
    services: Vec<Box<dyn ExtensionService>>,
    started: bool,
}

impl ExtensionServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently started extensions.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Instantiates `names` from the registry and starts each in order.
    ///
    /// An unknown name or a failing extension aborts the start; extensions
    /// already started in this call remain tracked so `stop` reaches them.
    pub fn start(
        &mut self,
        registry: &ExtensionRegistry,
        names: &[String],
        binding: &ServiceBinding,
    ) -> Result<()> {
        if self.started {
            warn!("extension services already started");
            return Ok(());
        }
        self.started = true;

        for name in names {
            let Some(mut service) = registry.create(name) else {
                bail!("unknown extension service: {name}");
            };

            service
                .start(binding)
                .with_context(|| format!("starting extension {name}"))?;
            debug!(name = service.name(), "extension started");
            self.services.push(service);
        }

        if !self.services.is_empty() {
            info!(count = self.services.len(), "extension services started");
        }

        Ok(())
    }

    /// Stops every started extension. Safe to call repeatedly.
    pub fn stop(&mut self) {
        for service in &mut self.services {
            debug!(name = service.name(), "stopping extension");
            service.stop();
        }
        self.services.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingExtension {
        name: String,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl ExtensionService for CountingExtension {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self, _binding: &ServiceBinding) -> Result<()> {
            if self.fail_start {
                bail!("refusing to start");
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn binding() -> ServiceBinding {
        ServiceBinding {
            app_id: "application_1".into(),
            attempt_id: None,
            group_id: None,
            user: "alice".into(),
            spark_version: "2.1.0".into(),
        }
    }

    fn registry(
        starts: &Arc<AtomicUsize>,
        stops: &Arc<AtomicUsize>,
        fail: bool,
    ) -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        let starts = Arc::clone(starts);
        let stops = Arc::clone(stops);
        registry.register("demo.Extension", move || {
            Box::new(CountingExtension {
                name: "demo.Extension".into(),
                starts: Arc::clone(&starts),
                stops: Arc::clone(&stops),
                fail_start: fail,
            })
        });
        registry
    }

    #[test]
    fn test_start_and_stop_fan_out() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = registry(&starts, &stops, false);

        let names = vec!["demo.Extension".to_string(), "demo.Extension".to_string()];
        let mut services = ExtensionServices::new();
        services
            .start(&registry, &names, &binding())
            .expect("starts");

        assert_eq!(services.len(), 2);
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        services.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(services.is_empty());

        // Idempotent.
        services.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_double_start_is_noop() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let registry = registry(&starts, &stops, false);
        let names = vec!["demo.Extension".to_string()];

        let mut services = ExtensionServices::new();
        services.start(&registry, &names, &binding()).expect("ok");
        services.start(&registry, &names, &binding()).expect("noop");

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(services.len(), 1);
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let registry = ExtensionRegistry::new();
        let names = vec!["missing.Extension".to_string()];

        let mut services = ExtensionServices::new();
        let err = services
            .start(&registry, &names, &binding())
            .expect_err("unknown name fails");
        assert!(err.to_string().contains("missing.Extension"));
    }

    #[test]
    fn test_failed_start_keeps_earlier_extensions_stoppable() {
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let mut registry = registry(&starts, &stops, false);
        {
            let stops = Arc::clone(&stops);
            registry.register("demo.Broken", move || {
                Box::new(CountingExtension {
                    name: "demo.Broken".into(),
                    starts: Arc::new(AtomicUsize::new(0)),
                    stops: Arc::clone(&stops),
                    fail_start: true,
                })
            });
        }

        let names = vec!["demo.Extension".to_string(), "demo.Broken".to_string()];
        let mut services = ExtensionServices::new();
        assert!(services.start(&registry, &names, &binding()).is_err());

        // The successfully started extension is still tracked and stops.
        assert_eq!(services.len(), 1);
        services.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
