use super::{FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Activity failure with a retry classification. Retriable failures go
/// back to the worker queue under the runtime's retry policy; permanent
/// ones surface to the orchestrator as `TaskFailed` immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub message: String,
    pub retriable: bool,
}

impl ActivityError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ActivityError {}

// Plain-string errors default to retriable; transient causes are the
// common case for activities.
impl From<String> for ActivityError {
    fn from(message: String) -> Self {
        ActivityError::retriable(message)
    }
}

impl From<&str> for ActivityError {
    fn from(message: &str) -> Self {
        ActivityError::retriable(message.to_string())
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}

/// Immutable name -> handler map for activities; all lookups at dispatch
/// time are fallible, and an unknown name is a permanent failure.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
    errors: Vec<String>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        let mut b = ActivityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        };
        // Pre-register system activities before any user registration
        b = b.register(crate::SYSTEM_TRACE_ACTIVITY, |input: String| async move {
            let (level, msg) = match input.split_once(':') {
                Some((l, m)) => (l.to_string(), m.to_string()),
                None => ("INFO".to_string(), input),
            };
            match level.as_str() {
                "ERROR" => error!(message=%msg, "system trace"),
                "WARN" | "WARNING" => warn!(message=%msg, "system trace"),
                "DEBUG" => debug!(message=%msg, "system trace"),
                _ => info!(message=%msg, "system trace"),
            }
            Ok(format!("{}:{}", level, msg))
        });
        b = b.register(crate::SYSTEM_NOW_ACTIVITY, |_input: String| async move {
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            Ok(now_ms.to_string())
        });
        b = b.register(crate::SYSTEM_NEW_GUID_ACTIVITY, |_input: String| async move {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            Ok(format!("{nanos:032x}"))
        });
        b
    }
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }
    pub fn list_activity_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

impl ActivityRegistryBuilder {
    pub fn from_registry(reg: &ActivityRegistry) -> Self {
        let mut map: HashMap<String, Arc<dyn ActivityHandler>> = HashMap::new();
        for (k, v) in reg.inner.iter() {
            map.insert(k.clone(), v.clone());
        }
        ActivityRegistryBuilder {
            map,
            errors: Vec::new(),
        }
    }
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnActivity(f)));
        self
    }
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, ActivityError>> + Send + 'static,
    {
        let f_clone = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = crate::codec::decode(&input_s).map_err(ActivityError::permanent)?;
                let out: Out = (f_inner)(input).await?;
                crate::codec::encode(&out).map_err(ActivityError::permanent)
            }
        };
        self.register(name, wrapper)
    }
    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
    pub fn build_result(self) -> Result<ActivityRegistry, String> {
        if self.errors.is_empty() {
            Ok(ActivityRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

/// Immutable name -> handler map for orchestrations.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        if self.map.contains_key(&name) {
            self.errors
                .push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        self.map.insert(name, Arc::new(FnOrchestration(f)));
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f_clone = f.clone();
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f_clone.clone();
            async move {
                let input: In = crate::codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::codec::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(OrchestrationRegistry {
                inner: Arc::new(self.map),
            })
        } else {
            Err(self.errors.join("; "))
        }
    }
}
