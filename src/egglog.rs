//! Printing reconstruction rules for the upstream rewriter.
//!
//! The prologue re-declares the operator constructors, then each function
//! extraction becomes one rule whose body is a `let`-chain in topological
//! order, and the epilogue runs the `reconstruction` ruleset once.

use std::io::Write;

use crate::egraph::{EGraph, Extraction};

// Verbatim interface of the upstream rewriter; not ours to restyle.
const PROLOGUE: &str = r#"
(datatype Expr)

(sort TypeList)

(datatype BaseType
  (IntT)
  (BoolT)
  (FloatT)
  (PointerT BaseType)
  (StateT)
)

(datatype Type
  (Base BaseType)
  (TupleT TypeList)
)

(constructor TNil () TypeList)
(constructor TCons (BaseType TypeList) TypeList)

(let DumT (TupleT (TNil)))

(datatype Assumption
  (DumC)
)

(constructor Arg (Type Assumption) Expr)

(datatype Constant
  (Int i64)
  (Bool bool)
  (Float f64)
)

(constructor Empty (Type Assumption) Expr)

(constructor Const (Constant Type Assumption) Expr)

(datatype TernaryOp
  (Write)
  (Select)
)

(datatype BinaryOp
  (Bitand)
  (Add)
  (Sub)
  (Div)
  (Mul)
  (LessThan)
  (GreaterThan)
  (LessEq)
  (GreaterEq)
  (Eq)
  (Smin)
  (Smax)
  (Shl)
  (Shr)
  (FAdd)
  (FSub)
  (FDiv)
  (FMul)
  (FLessThan)
  (FGreaterThan)
  (FLessEq)
  (FGreaterEq)
  (FEq)
  (Fmin)
  (Fmax)
  (And)
  (Or)
  (Load)
  (PtrAdd)
  (Print)
  (Free)
)

(datatype UnaryOp
  (Neg)
  (Abs)
  (Not)
)

(constructor Top   (TernaryOp Expr Expr Expr) Expr)
(constructor Bop   (BinaryOp Expr Expr) Expr)
(constructor Uop   (UnaryOp Expr) Expr)

(constructor Get   (Expr i64) Expr)
(constructor Alloc (i64 Expr Expr BaseType) Expr)
(constructor Call  (String Expr) Expr)

(constructor Single (Expr) Expr)
(constructor Concat (Expr Expr) Expr)

(constructor If (Expr Expr Expr Expr) Expr)

(constructor DoWhile (Expr Expr) Expr)

(constructor Function (String Type Type Expr) Expr)

(ruleset reconstruction)
"#;

pub struct RulePrinter {
    fun_id: usize,
    next_tmp: usize,
}

impl RulePrinter {
    pub fn new() -> Self {
        RulePrinter {
            fun_id: 0,
            next_tmp: 0,
        }
    }

    pub fn prologue(&self, out: &mut impl Write) -> std::io::Result<()> {
        write!(out, "{}", PROLOGUE)
    }

    /// One rule per extraction: a let-chain binding a fresh symbol per node.
    /// Primitive literals are inlined instead of bound.
    pub fn rule(&mut self, out: &mut impl Write, g: &EGraph, e: &Extraction) -> std::io::Result<()> {
        self.fun_id += 1;
        writeln!(out, "; Function #{}", self.fun_id)?;
        writeln!(out, "(rule () (")?;
        let mut var: Vec<String> = Vec::with_capacity(e.len());
        for rec in e {
            let node = g.node(rec.c, rec.n);
            let (name, op) = (node.name(), node.op());
            if name.len() > 9 && name.starts_with("primitive") {
                var.push(op.to_string());
                continue;
            }
            let cur = format!("__tmp{}", self.next_tmp);
            self.next_tmp += 1;
            write!(out, "\t(let {} (", cur)?;
            match op {
                // The exporter erases concrete types and assumptions; the
                // dummy ones satisfy the constructors.
                "Arg" => {
                    debug_assert!(rec.children.is_empty());
                    write!(out, "Arg DumT (DumC)")?;
                }
                "Const" => {
                    debug_assert_eq!(rec.children.len(), 1);
                    write!(out, "Const {} DumT (DumC)", var[rec.children[0]])?;
                }
                "Empty" => {
                    debug_assert!(rec.children.is_empty());
                    write!(out, "Empty DumT (DumC)")?;
                }
                _ => {
                    write!(out, "{}", op)?;
                    for &ch in &rec.children {
                        write!(out, " {}", var[ch])?;
                    }
                }
            }
            writeln!(out, "))")?;
            var.push(cur);
        }
        writeln!(out, ") :ruleset reconstruction)")
    }

    pub fn epilogue(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "(run reconstruction 1)")
    }
}

impl Default for RulePrinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Print the whole program: prologue, one rule per function, epilogue.
pub fn print_rules(
    out: &mut impl Write,
    g: &EGraph,
    extractions: &[(crate::egraph::ClassId, Extraction)],
) -> std::io::Result<()> {
    let mut printer = RulePrinter::new();
    printer.prologue(out)?;
    for (_, e) in extractions {
        printer.rule(out, g, e)?;
    }
    printer.epilogue(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egraph::ExtractionNode;
    use crate::test_graphs::GraphBuilder;

    #[test]
    fn rule_binds_nodes_in_order_and_inlines_primitives() {
        let mut b = GraphBuilder::new();
        let lit = b.class(false);
        b.named_node(lit, "primitive-lit0", "7", &[]);
        let cst = b.class(false);
        b.node(cst, "Const", &[lit]);
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let root = b.class(true);
        b.node(root, "Print", &[arg, cst]);
        let g = b.build();

        let e = vec![
            ExtractionNode { c: lit, n: 0, children: vec![] },
            ExtractionNode { c: cst, n: 0, children: vec![0] },
            ExtractionNode { c: arg, n: 0, children: vec![] },
            ExtractionNode { c: root, n: 0, children: vec![2, 1] },
        ];
        let mut out = Vec::new();
        let mut printer = RulePrinter::new();
        printer.rule(&mut out, &g, &e).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("; Function #1\n(rule () (\n"));
        // The literal is inlined into the Const, not bound.
        assert!(text.contains("(let __tmp0 (Const 7 DumT (DumC)))"));
        assert!(text.contains("(let __tmp1 (Arg DumT (DumC)))"));
        assert!(text.contains("(let __tmp2 (Print __tmp1 __tmp0))"));
        assert!(text.ends_with(") :ruleset reconstruction)\n"));
    }

    #[test]
    fn string_primitives_stay_quoted() {
        let mut b = GraphBuilder::new();
        let s = b.class(false);
        b.named_node(s, "primitive-name0", "\"main\"", &[]);
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let root = b.class(true);
        b.node(root, "Call", &[s, arg]);
        let g = b.build();

        let e = vec![
            ExtractionNode { c: s, n: 0, children: vec![] },
            ExtractionNode { c: arg, n: 0, children: vec![] },
            ExtractionNode { c: root, n: 0, children: vec![0, 1] },
        ];
        let mut out = Vec::new();
        let mut printer = RulePrinter::new();
        printer.rule(&mut out, &g, &e).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("(let __tmp1 (Call \"main\" __tmp0))"));
    }

    #[test]
    fn tmp_symbols_are_unique_across_functions() {
        let mut b = GraphBuilder::new();
        let arg = b.class(true);
        b.node(arg, "Arg", &[]);
        let g = b.build();
        let e = vec![ExtractionNode { c: arg, n: 0, children: vec![] }];

        let mut out = Vec::new();
        print_rules(&mut out, &g, &[(arg, e.clone()), (arg, e)]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("; Function #1"));
        assert!(text.contains("; Function #2"));
        assert!(text.contains("(let __tmp0 (Arg DumT (DumC)))"));
        assert!(text.contains("(let __tmp1 (Arg DumT (DumC)))"));
        assert!(text.trim_end().ends_with("(run reconstruction 1)"));
    }
}
