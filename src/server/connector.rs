//! Connector registry: priority-ordered request handlers.

use crate::{errors::Outcome, http::message::Message, server::client::HandlerCtx};
use std::sync::Arc;

/// Standard connector priorities; dispatch walks ascending.
pub mod priority {
    pub const FILTER: i32 = 0;
    pub const AUTH: i32 = 1;
    pub const DOCFILTER: i32 = 4;
    pub const DOCUMENT: i32 = 5;
    pub const ERROR: i32 = 10;
}

/// Handler signature. The first non-[`Reject`](Outcome::Reject) return
/// captures the request for this connector.
pub type ConnectorFn =
    dyn Fn(&mut HandlerCtx<'_>, &mut Message, &mut Message) -> Outcome + Send + Sync;

#[derive(Clone)]
pub(crate) struct Connector {
    pub name: String,
    pub priority: i32,
    pub func: Arc<ConnectorFn>,
}

/// Priority-ordered connector list; insertion is stable for equal
/// priorities, so registration order breaks ties.
#[derive(Clone, Default)]
pub(crate) struct ConnectorList {
    items: Vec<Connector>,
}

impl ConnectorList {
    pub(crate) fn add(&mut self, name: &str, priority: i32, func: Arc<ConnectorFn>) {
        let at = self
            .items
            .iter()
            .position(|c| c.priority > priority)
            .unwrap_or(self.items.len());
        self.items.insert(
            at,
            Connector {
                name: name.into(),
                priority,
                func,
            },
        );
    }

    #[inline(always)]
    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Connector> {
        self.items.iter()
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> Option<&Connector> {
        self.items.get(index)
    }

    /// Connectors registered at [`priority::ERROR`], for error pages.
    pub(crate) fn error_connectors(&self) -> impl Iterator<Item = (usize, &Connector)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, c)| c.priority == priority::ERROR)
    }
}

#[cfg(test)]
mod connector_tests {
    use super::*;

    fn noop() -> Arc<ConnectorFn> {
        Arc::new(|_, _, _| Outcome::Reject)
    }

    #[test]
    fn ordered_by_priority_then_registration() {
        let mut list = ConnectorList::default();
        list.add("doc", priority::DOCUMENT, noop());
        list.add("filter", priority::FILTER, noop());
        list.add("auth", priority::AUTH, noop());
        list.add("doc2", priority::DOCUMENT, noop());
        list.add("err", priority::ERROR, noop());

        let names: Vec<_> = list.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["filter", "auth", "doc", "doc2", "err"]);

        let priorities: Vec<_> = list.iter().map(|c| c.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn error_connectors_filtered() {
        let mut list = ConnectorList::default();
        list.add("doc", priority::DOCUMENT, noop());
        list.add("err", priority::ERROR, noop());
        assert_eq!(list.error_connectors().count(), 1);
    }
}
