use std::fmt;

use serde::{Deserialize, Serialize};

/// Program model consumed by the analysis engine.
///
/// The model arrives already parsed; the engine never reads class-file
/// containers itself. A JSON encoding of this type is the external input
/// surface of the driver binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Program {
    pub classes: Vec<Class>,
}

impl Program {
    pub fn find_class(&self, name: &str) -> Option<&Class> {
        self.classes.iter().find(|class| class.name == name)
    }

    pub fn find_method(&self, descriptor: &MethodDescriptor) -> Option<(&Class, &Method)> {
        let class = self.find_class(&descriptor.class_name)?;
        let method = class.methods.iter().find(|method| {
            method.name == descriptor.name && method.descriptor == descriptor.descriptor
        })?;
        Some((class, method))
    }
}

/// Parsed JVM class with its methods.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub super_name: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub is_final: bool,
    /// Whether this class belongs to the analysis target rather than the
    /// classpath. Detectors skip non-application classes unless the
    /// interprocedural option widens the scope.
    #[serde(default = "default_true")]
    pub is_application: bool,
    pub methods: Vec<Method>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Method body and metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub descriptor: String,
    pub access: MethodAccess,
    /// Local variable slots, parameters included.
    pub max_locals: u16,
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl Method {
    pub fn descriptor_for(&self, class: &Class) -> MethodDescriptor {
        MethodDescriptor {
            class_name: class.name.clone(),
            name: self.name.clone(),
            descriptor: self.descriptor.clone(),
        }
    }

    pub fn has_body(&self) -> bool {
        !self.instructions.is_empty()
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    /// Whether the method cannot be overridden: static, final, private, or a
    /// constructor. Used when deciding report priority.
    pub fn is_effectively_final(&self) -> bool {
        self.access.is_static
            || self.access.is_final
            || self.access.is_private
            || self.is_constructor()
    }
}

/// Method access flags used for analysis scoping and priority decisions.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MethodAccess {
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_abstract: bool,
}

/// Stable identity for a method, used as a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Exception handler metadata, offsets into the owning method's instructions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_type: Option<String>,
}

/// One instruction at a bytecode offset.
///
/// Offsets are opaque labels: they must be strictly increasing within a
/// method and branch targets must name an existing offset, but no byte-level
/// encoding is implied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub op: Op,
}

/// Abstract instruction set, reduced to the shapes the dataflow analyses
/// interpret.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Push the value in a local slot.
    LoadLocal(u16),
    /// Pop into a local slot.
    StoreLocal(u16),
    /// Push a constant (including the null constant).
    PushConst(ConstValue),
    /// Allocate an instance, pushing a fresh reference.
    New(String),
    Dup,
    Pop,
    /// Pop an object reference, push the field value.
    GetField(FieldRef),
    /// Push a static field value.
    GetStatic(FieldRef),
    /// Pop a value and an object reference.
    PutField(FieldRef),
    /// Pop arguments (and receiver unless static); push the return value for
    /// non-void call targets.
    Invoke(CallSite),
    IfNull { target: u32 },
    IfNonNull { target: u32 },
    /// Any other conditional branch; pops one operand.
    If { target: u32 },
    Goto { target: u32 },
    /// Void return.
    Return,
    /// Pop and return a value.
    ReturnValue,
    /// Pop and throw.
    Throw,
    Nop,
}

impl Op {
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Op::IfNull { target }
            | Op::IfNonNull { target }
            | Op::If { target }
            | Op::Goto { target } => Some(*target),
            _ => None,
        }
    }

    pub fn is_unconditional_branch(&self) -> bool {
        matches!(self, Op::Goto { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Op::Return | Op::ReturnValue | Op::Throw)
    }
}

/// Constant operand of a push instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Null,
    Int(i64),
    Str(String),
}

/// Field reference as it appears in field access instructions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// Call site extracted from an invoke instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub kind: CallKind,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallKind {
    pub fn has_receiver(&self) -> bool {
        !matches!(self, CallKind::Static)
    }
}
