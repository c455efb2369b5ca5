//! Global variable declarations.

use std::fmt::Write as _;

/// One initializer chunk of a global.
#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    Data(Vec<u8>),
    Zero(usize),
    /// Pointer-sized relocation against another symbol.
    Reloc { name: String, offset: i32 },
}

impl Initializer {
    pub fn num_bytes(&self) -> usize {
        match self {
            Initializer::Data(bytes) => bytes.len(),
            Initializer::Zero(n) => *n,
            Initializer::Reloc { .. } => 4,
        }
    }
}

/// A global data declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalDecl {
    pub name: String,
    pub align: u32,
    pub constant: bool,
    pub initializers: Vec<Initializer>,
}

impl GlobalDecl {
    pub fn new(name: impl Into<String>) -> GlobalDecl {
        GlobalDecl {
            name: name.into(),
            align: 1,
            constant: false,
            initializers: Vec::new(),
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.initializers.iter().map(Initializer::num_bytes).sum()
    }

    /// True when any initializer is something other than zero fill.
    pub fn has_nonzero_initializer(&self) -> bool {
        self.initializers
            .iter()
            .any(|init| !matches!(init, Initializer::Zero(_)))
    }
}

pub type GlobalList = Vec<GlobalDecl>;

/// Render a global list for diagnostics.
pub fn dump_globals(globals: &[GlobalDecl]) -> String {
    let mut s = String::new();
    for g in globals {
        let kind = if g.constant { "const" } else { "var" };
        let _ = writeln!(
            s,
            "{kind} @{} : {} bytes, align {}",
            g.name,
            g.num_bytes(),
            g.align
        );
        for init in &g.initializers {
            match init {
                Initializer::Data(bytes) => {
                    let _ = writeln!(s, "  data[{}]", bytes.len());
                }
                Initializer::Zero(n) => {
                    let _ = writeln!(s, "  zero[{n}]");
                }
                Initializer::Reloc { name, offset } => {
                    let _ = writeln!(s, "  reloc @{name}+{offset}");
                }
            }
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_sizes() {
        let mut g = GlobalDecl::new("g");
        g.initializers.push(Initializer::Data(vec![1, 2, 3]));
        g.initializers.push(Initializer::Zero(5));
        assert_eq!(g.num_bytes(), 8);
        assert!(g.has_nonzero_initializer());

        let mut z = GlobalDecl::new("z");
        z.initializers.push(Initializer::Zero(16));
        assert!(!z.has_nonzero_initializer());
    }
}
