//! Hand-written e-graphs for the test suites.

use crate::config::Config;
use crate::egraph::{ClassId, EClass, EGraph, ENode, NodeId, HEAD_DELIM};

pub struct GraphBuilder {
    classes: Vec<EClass>,
    next_name: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder {
            classes: Vec::new(),
            next_name: 0,
        }
    }

    pub fn class(&mut self, effectful: bool) -> ClassId {
        self.classes.push(EClass {
            nodes: Vec::new(),
            effectful,
        });
        self.classes.len() - 1
    }

    pub fn node(&mut self, class: ClassId, op: &str, children: &[ClassId]) -> NodeId {
        let name = format!("n{}", self.next_name);
        self.next_name += 1;
        self.named_node(class, &name, op, children)
    }

    pub fn named_node(
        &mut self,
        class: ClassId,
        name: &str,
        op: &str,
        children: &[ClassId],
    ) -> NodeId {
        self.classes[class].nodes.push(ENode {
            head: format!("{}{}{}", name, HEAD_DELIM, op),
            class,
            children: children.to_vec(),
        });
        self.classes[class].nodes.len() - 1
    }

    pub fn build(self) -> EGraph {
        EGraph {
            classes: self.classes,
        }
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Default configuration for tests: state-walk engine, no timing.
pub fn test_config() -> Config {
    Config::default()
}
