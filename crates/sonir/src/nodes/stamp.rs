/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * 2024 Tendsin Mende
 */

//! Stamps are the type-lattice of the graph. Every node carries one. Value nodes use it to describe the
//! range of values they can produce, while control, memory and void nodes just carry their category.

use std::fmt::Display;

use super::{ClassId, Constant, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stamp {
    ///Node does not produce a value (stores, checkpoints etc.)
    Void,
    ///Control-only node
    Control,
    ///Memory state (memory phis)
    Memory,
    Bool,
    Int {
        lower: i64,
        upper: i64,
    },
    Object {
        non_null: bool,
        ///Set if the exact class of the object is known.
        exact: Option<ClassId>,
    },
    ///Result of meeting incompatible stamps.
    Illegal,
}

impl Stamp {
    pub const INT: Self = Stamp::Int {
        lower: i64::MIN,
        upper: i64::MAX,
    };

    pub const OBJECT: Self = Stamp::Object {
        non_null: false,
        exact: None,
    };

    ///The unrestricted stamp for values of `kind`.
    pub fn for_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int => Self::INT,
            ValueKind::Bool => Self::Bool,
            ValueKind::Object => Self::OBJECT,
        }
    }

    pub fn for_constant(constant: &Constant) -> Self {
        match constant {
            Constant::Int(i) => Stamp::Int {
                lower: *i,
                upper: *i,
            },
            Constant::Bool(_) => Stamp::Bool,
            Constant::Null => Stamp::Object {
                non_null: false,
                exact: None,
            },
        }
    }

    ///Stamp of a freshly allocated object.
    pub fn allocation(class: Option<ClassId>) -> Self {
        Stamp::Object {
            non_null: true,
            exact: class,
        }
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, Stamp::Object { non_null: true, .. })
    }

    pub fn exact_class(&self) -> Option<ClassId> {
        if let Stamp::Object { exact, .. } = self {
            *exact
        } else {
            None
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Stamp::Bool | Stamp::Int { .. } | Stamp::Object { .. })
    }

    ///Lattice meet. The result describes any value that is described by either `self` or `other`.
    pub fn meet(&self, other: &Stamp) -> Stamp {
        match (self, other) {
            (Stamp::Illegal, _) | (_, Stamp::Illegal) => Stamp::Illegal,
            (Stamp::Void, Stamp::Void) => Stamp::Void,
            (Stamp::Control, Stamp::Control) => Stamp::Control,
            (Stamp::Memory, Stamp::Memory) => Stamp::Memory,
            (Stamp::Bool, Stamp::Bool) => Stamp::Bool,
            (
                Stamp::Int {
                    lower: la,
                    upper: ua,
                },
                Stamp::Int {
                    lower: lb,
                    upper: ub,
                },
            ) => Stamp::Int {
                lower: *la.min(lb),
                upper: *ua.max(ub),
            },
            (
                Stamp::Object {
                    non_null: na,
                    exact: ea,
                },
                Stamp::Object {
                    non_null: nb,
                    exact: eb,
                },
            ) => Stamp::Object {
                non_null: *na && *nb,
                exact: if ea == eb { *ea } else { None },
            },
            _ => Stamp::Illegal,
        }
    }
}

impl Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stamp::Void => write!(f, "void"),
            Stamp::Control => write!(f, "ctrl"),
            Stamp::Memory => write!(f, "mem"),
            Stamp::Bool => write!(f, "bool"),
            Stamp::Int { lower, upper } => {
                if *lower == i64::MIN && *upper == i64::MAX {
                    write!(f, "int")
                } else {
                    write!(f, "int[{lower}..{upper}]")
                }
            }
            Stamp::Object { non_null, exact } => {
                write!(f, "obj")?;
                if *non_null {
                    write!(f, "!")?;
                }
                if let Some(c) = exact {
                    write!(f, "<{}>", c.0)?;
                }
                Ok(())
            }
            Stamp::Illegal => write!(f, "illegal"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_meet_widens() {
        let a = Stamp::for_constant(&Constant::Int(3));
        let b = Stamp::for_constant(&Constant::Int(-2));
        assert!(a.meet(&b) == Stamp::Int { lower: -2, upper: 3 });
    }

    #[test]
    fn object_meet_drops_exactness() {
        let a = Stamp::allocation(Some(ClassId(1)));
        let b = Stamp::allocation(Some(ClassId(2)));
        let c = Stamp::for_constant(&Constant::Null);
        assert!(a.meet(&a) == a);
        assert!(a.meet(&b) == Stamp::allocation(None));
        assert!(!a.meet(&c).is_non_null());
    }

    #[test]
    fn mismatch_is_illegal() {
        assert!(Stamp::Bool.meet(&Stamp::INT) == Stamp::Illegal);
    }
}
