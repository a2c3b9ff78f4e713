use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ir::MethodDescriptor;

pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 2;
pub const PRIORITY_LOW: u8 = 3;
pub const PRIORITY_EXPERIMENTAL: u8 = 4;

/// Raise a priority one step, saturating at high.
pub fn raise_priority(priority: u8) -> u8 {
    priority.saturating_sub(1).max(PRIORITY_HIGH)
}

/// One element of program structure a report points at. A report carries its
/// annotations in order of decreasing specificity: the first one is the
/// primary location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Annotation {
    Class {
        name: String,
    },
    Method {
        descriptor: MethodDescriptor,
    },
    Parameter {
        index: usize,
    },
    SourceOffset {
        offset: u32,
    },
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Annotation::Class { name } => write!(f, "class {name}"),
            Annotation::Method { descriptor } => write!(f, "method {descriptor}"),
            Annotation::Parameter { index } => write!(f, "parameter {index}"),
            Annotation::SourceOffset { offset } => write!(f, "offset {offset}"),
        }
    }
}

/// One defect found by a detector, identified by its bug pattern code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefectReport {
    pub pattern: String,
    pub priority: u8,
    pub annotations: Vec<Annotation>,
}

impl DefectReport {
    pub fn new(pattern: impl Into<String>, priority: u8) -> Self {
        DefectReport {
            pattern: pattern.into(),
            priority,
            annotations: Vec::new(),
        }
    }

    pub fn with_class(mut self, name: impl Into<String>) -> Self {
        self.annotations.push(Annotation::Class { name: name.into() });
        self
    }

    pub fn with_method(mut self, descriptor: MethodDescriptor) -> Self {
        self.annotations.push(Annotation::Method { descriptor });
        self
    }

    pub fn with_parameter(mut self, index: usize) -> Self {
        self.annotations.push(Annotation::Parameter { index });
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.annotations.push(Annotation::SourceOffset { offset });
        self
    }

    pub fn method(&self) -> Option<&MethodDescriptor> {
        self.annotations.iter().find_map(|annotation| match annotation {
            Annotation::Method { descriptor } => Some(descriptor),
            _ => None,
        })
    }

    pub fn class_name(&self) -> Option<&str> {
        self.annotations.iter().find_map(|annotation| match annotation {
            Annotation::Class { name } => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Sink for detector output. Implementations must tolerate concurrent calls
/// from parallel class visits.
pub trait Reporter: Send + Sync {
    fn report(&self, defect: DefectReport);
    /// Non-defect observation worth surfacing, e.g. a skipped class.
    fn log(&self, message: &str);
}

/// Reporter accumulating everything in memory, ordered for stable output.
#[derive(Default)]
pub struct CollectingReporter {
    defects: Mutex<Vec<DefectReport>>,
    messages: Mutex<Vec<String>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter::default()
    }

    /// Drain collected defects, sorted by class, pattern, and priority.
    pub fn into_defects(self) -> Vec<DefectReport> {
        let mut defects = self.defects.into_inner();
        defects.sort_by(|a, b| {
            let key = |d: &DefectReport| {
                (
                    d.class_name().map(str::to_string),
                    d.method().cloned(),
                    d.pattern.clone(),
                    d.priority,
                )
            };
            key(a).cmp(&key(b))
        });
        defects
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn defect_count(&self) -> usize {
        self.defects.lock().len()
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, defect: DefectReport) {
        self.defects.lock().push(defect);
    }

    fn log(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}
