//! Resource registration and routing: product code registers CoAP
//! resources by path, and the registry dispatches inbound requests to them
//! plus serves the CoRE Link Format discovery resource
//! (`spec.md` §4.9, RFC 6690).

use crate::coap::{CoapCode, CoapMessage};

/// A single routable CoAP resource.
pub trait Resource: std::fmt::Debug {
    /// Path this resource is registered under, without a leading slash.
    fn path(&self) -> &str;

    /// Handles a request already routed to this resource's path, returning
    /// the response code and payload.
    fn handle(&mut self, request: &CoapMessage) -> (CoapCode, Vec<u8>);
}

/// A routing table of [`Resource`]s plus the synthesized discovery
/// resource at `/.well-known/core`.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: Vec<Box<dyn Resource>>,
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource: Box<dyn Resource>) {
        self.resources.push(resource);
    }

    /// Renders the CoRE Link Format body listing every registered path
    /// (`spec.md` §4.9, discovery endpoint).
    #[must_use]
    pub fn discovery_body(&self) -> Vec<u8> {
        self.resources
            .iter()
            .map(|r| format!("<{}>", r.path()))
            .collect::<Vec<_>>()
            .join(",")
            .into_bytes()
    }

    /// Routes `request` to the matching resource (or the synthesized
    /// discovery resource), returning the response code and payload.
    pub fn dispatch(&mut self, request: &CoapMessage) -> (CoapCode, Vec<u8>) {
        let path = request.uri_path();
        if path == ".well-known/core" {
            if request.code != CoapCode::GET {
                return (CoapCode::METHOD_NOT_ALLOWED, Vec::new());
            }
            return (CoapCode::CONTENT, self.discovery_body());
        }
        match self.resources.iter_mut().find(|r| r.path() == path) {
            Some(resource) => resource.handle(request),
            None => (CoapCode::NOT_FOUND, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::{CoapOption, CoapType};
    use crate::coap::message::Option_;

    #[derive(Debug)]
    struct EchoResource;
    impl Resource for EchoResource {
        fn path(&self) -> &str {
            "echo"
        }
        fn handle(&mut self, request: &CoapMessage) -> (CoapCode, Vec<u8>) {
            (CoapCode::CONTENT, request.payload.clone())
        }
    }

    fn request_for(path: &str) -> CoapMessage {
        CoapMessage {
            msg_type: CoapType::Confirmable,
            code: CoapCode::GET,
            message_id: 1,
            token: Vec::new(),
            options: vec![Option_ {
                number: CoapOption::UriPath as u16,
                value: path.as_bytes().to_vec(),
            }],
            payload: Vec::new(),
        }
    }

    #[test]
    fn dispatches_to_registered_resource() {
        let mut registry = ResourceRegistry::new();
        registry.register(Box::new(EchoResource));
        let (code, _) = registry.dispatch(&request_for("echo"));
        assert_eq!(code, CoapCode::CONTENT);
    }

    #[test]
    fn unknown_path_is_not_found() {
        let mut registry = ResourceRegistry::new();
        let (code, _) = registry.dispatch(&request_for("nope"));
        assert_eq!(code, CoapCode::NOT_FOUND);
    }

    #[test]
    fn discovery_lists_registered_paths() {
        let mut registry = ResourceRegistry::new();
        registry.register(Box::new(EchoResource));
        let (code, body) = registry.dispatch(&request_for(".well-known/core"));
        assert_eq!(code, CoapCode::CONTENT);
        assert_eq!(body, b"</echo>");
    }
}
