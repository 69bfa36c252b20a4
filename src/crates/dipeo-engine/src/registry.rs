//! Handler registry: `NodeType -> handler`, resolved once per dispatch.

use crate::handler::{NodeHandler, Services};
use crate::handlers;
use dashmap::DashMap;
use dipeo_core::diagram::{Diagram, NodeType};
use dipeo_core::error::ExecutionError;
use std::collections::HashSet;
use std::sync::Arc;

pub struct HandlerRegistry {
    handlers: DashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Registry pre-populated with every built-in handler.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(handlers::StartHandler));
        registry.register(Arc::new(handlers::EndpointHandler));
        registry.register(Arc::new(handlers::ConditionHandler));
        registry.register(Arc::new(handlers::PersonJobHandler));
        registry.register(Arc::new(handlers::CodeJobHandler));
        registry.register(Arc::new(handlers::ApiJobHandler));
        registry.register(Arc::new(handlers::DbHandler));
        registry.register(Arc::new(handlers::UserResponseHandler));
        registry.register(Arc::new(handlers::SubDiagramHandler));
        registry
    }

    /// Register (or replace) the handler for its node type.
    pub fn register(&self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type(), handler);
    }

    pub fn resolve(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).map(|h| h.clone())
    }

    /// Fail fast when a diagram uses a node type with no handler, a handler
    /// whose required collaborator ports are not wired, or a node whose
    /// config does not validate.
    pub fn check_requirements(&self, diagram: &Diagram, services: &Services) -> Result<(), ExecutionError> {
        let used: HashSet<NodeType> = diagram.nodes().iter().map(|n| n.node_type).collect();
        for node_type in used {
            let handler = self.resolve(node_type).ok_or_else(|| {
                ExecutionError::Validation(format!(
                    "no handler registered for node type '{}'",
                    node_type.as_str()
                ))
            })?;
            for service in handler.required_services() {
                if !services.has(service) {
                    return Err(ExecutionError::Validation(format!(
                        "node type '{}' requires service '{}' which is not configured",
                        node_type.as_str(),
                        service
                    )));
                }
            }
        }
        for node in diagram.nodes() {
            if let Some(handler) = self.resolve(node.node_type) {
                handler.validate_config(node)?;
            }
        }
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
