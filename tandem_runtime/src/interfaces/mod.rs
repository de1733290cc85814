//! Per-interface bookkeeping objects: publications, inputs, endpoints, and
//! filters. The set is closed, so the variants are a tagged sum rather than
//! a trait hierarchy; dispatch points are few (register, accept an envelope,
//! snapshot for queries).

mod endpoint;
mod filter;
mod input;
mod publication;

pub use endpoint::{EndpointInfo, EndpointMessage};
pub use filter::{DelayFilter, FilterInfo, FilterOperator};
pub use input::{DataRecord, InputInfo};
pub use publication::PublicationInfo;

use tandem_core::GlobalHandle;

/// One registered interface at a node.
#[derive(Debug)]
pub enum InterfaceInfo {
    Publication(PublicationInfo),
    Input(InputInfo),
    Endpoint(EndpointInfo),
    Filter(FilterInfo),
}

impl InterfaceInfo {
    pub fn id(&self) -> GlobalHandle {
        match self {
            InterfaceInfo::Publication(p) => p.id,
            InterfaceInfo::Input(i) => i.id,
            InterfaceInfo::Endpoint(e) => e.id,
            InterfaceInfo::Filter(f) => f.id,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            InterfaceInfo::Publication(p) => &p.key,
            InterfaceInfo::Input(i) => &i.key,
            InterfaceInfo::Endpoint(e) => &e.key,
            InterfaceInfo::Filter(f) => &f.key,
        }
    }

    pub fn as_input_mut(&mut self) -> Option<&mut InputInfo> {
        match self {
            InterfaceInfo::Input(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_endpoint_mut(&mut self) -> Option<&mut EndpointInfo> {
        match self {
            InterfaceInfo::Endpoint(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_publication_mut(&mut self) -> Option<&mut PublicationInfo> {
        match self {
            InterfaceInfo::Publication(p) => Some(p),
            _ => None,
        }
    }
}
