use crate::errors::AnalysisError;

/// Parsed view of a JVM method descriptor such as `(Ljava/lang/Object;I)V`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: Vec<ParamType>,
    pub return_kind: ReturnKind,
}

/// One declared parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamType {
    pub is_reference: bool,
    /// `long` and `double` occupy two local slots.
    pub wide: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Reference,
    Primitive,
}

impl MethodSignature {
    pub fn parse(descriptor: &str) -> Result<Self, AnalysisError> {
        let malformed =
            || AnalysisError::InvalidModel(format!("malformed method descriptor {descriptor}"));
        let rest = descriptor.strip_prefix('(').ok_or_else(malformed)?;
        let close = rest.find(')').ok_or_else(malformed)?;
        let (param_text, return_text) = rest.split_at(close);
        let return_text = &return_text[1..];

        let mut params = Vec::new();
        let mut chars = param_text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'L' => {
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ';' {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(malformed());
                    }
                    params.push(ParamType {
                        is_reference: true,
                        wide: false,
                    });
                }
                '[' => {
                    while chars.peek() == Some(&'[') {
                        chars.next();
                    }
                    match chars.next() {
                        Some('L') => {
                            let mut closed = false;
                            for c in chars.by_ref() {
                                if c == ';' {
                                    closed = true;
                                    break;
                                }
                            }
                            if !closed {
                                return Err(malformed());
                            }
                        }
                        Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => {}
                        _ => return Err(malformed()),
                    }
                    // Arrays are references regardless of element type.
                    params.push(ParamType {
                        is_reference: true,
                        wide: false,
                    });
                }
                'D' | 'J' => params.push(ParamType {
                    is_reference: false,
                    wide: true,
                }),
                'B' | 'C' | 'F' | 'I' | 'S' | 'Z' => params.push(ParamType {
                    is_reference: false,
                    wide: false,
                }),
                _ => return Err(malformed()),
            }
        }

        let return_kind = match return_text.chars().next() {
            Some('V') => ReturnKind::Void,
            Some('L') | Some('[') => ReturnKind::Reference,
            Some('B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z') => ReturnKind::Primitive,
            _ => return Err(malformed()),
        };

        Ok(MethodSignature {
            params,
            return_kind,
        })
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Local slot index holding the parameter, accounting for the implicit
    /// `this` slot of instance methods and for wide parameters before it.
    pub fn param_slot(&self, index: usize, is_static: bool) -> u16 {
        let mut slot: u16 = if is_static { 0 } else { 1 };
        for param in self.params.iter().take(index) {
            slot += if param.wide { 2 } else { 1 };
        }
        slot
    }

    pub fn has_reference_params(&self) -> bool {
        self.params.iter().any(|param| param.is_reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_signature() {
        let sig = MethodSignature::parse("(Ljava/lang/String;JI[Ljava/lang/Object;)V")
            .expect("parse descriptor");
        assert_eq!(sig.param_count(), 4);
        assert!(sig.params[0].is_reference);
        assert!(sig.params[1].wide);
        assert!(!sig.params[2].is_reference);
        assert!(sig.params[3].is_reference);
        assert_eq!(sig.return_kind, ReturnKind::Void);
    }

    #[test]
    fn computes_parameter_slots_with_wide_types() {
        let sig = MethodSignature::parse("(JLjava/lang/String;)V").expect("parse descriptor");
        assert_eq!(sig.param_slot(0, true), 0);
        assert_eq!(sig.param_slot(1, true), 2);
        assert_eq!(sig.param_slot(0, false), 1);
        assert_eq!(sig.param_slot(1, false), 3);
    }

    #[test]
    fn classifies_return_kinds() {
        let reference = MethodSignature::parse("()Ljava/lang/String;").expect("parse");
        assert_eq!(reference.return_kind, ReturnKind::Reference);
        let primitive = MethodSignature::parse("()Z").expect("parse");
        assert_eq!(primitive.return_kind, ReturnKind::Primitive);
        let array = MethodSignature::parse("()[B").expect("parse");
        assert_eq!(array.return_kind, ReturnKind::Reference);
    }

    #[test]
    fn rejects_malformed_descriptors() {
        assert!(MethodSignature::parse("Ljava/lang/String;").is_err());
        assert!(MethodSignature::parse("(Ljava/lang/String)V").is_err());
        assert!(MethodSignature::parse("()").is_err());
    }
}
