//! The expression matcher.
//!
//! A predicate string is parsed once into an AST, rewritten so dotted
//! names become packet-field references (and NFS per-operation fields
//! become exists-over-the-compound wrappers), then evaluated against
//! each candidate packet. Evaluation errors (a predicate naming a layer
//! the packet does not carry) are silently treated as "no match", which
//! is what lets one predicate run over a heterogeneous trace.

mod eval;
mod expr;

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::trace;

pub use eval::Value;
use eval::{eval, Env};
use expr::{BinOp, Expr, Parser, UnaryOp};

use crate::pkt::Packet;

/// Matcher configuration carried on the trace handle: the registered
/// named constants (the NFS operation-name map) and the NFS attributes
/// that live on the compound itself rather than on its operations.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub constants: HashMap<String, i64>,
    pub nfs_compound_attrs: HashSet<String>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let nfs_compound_attrs =
            ["status", "tag", "minorversion"].into_iter().map(str::to_string).collect();
        Self { constants: HashMap::new(), nfs_compound_attrs }
    }
}

/// A parsed and rewritten predicate.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    ast: Expr,
}

/// Parses and rewrites a predicate string.
pub fn compile(input: &str, config: &MatcherConfig) -> Result<CompiledExpr> {
    let parsed = Parser::parse(input)?;
    let resolved = resolve_paths(parsed);
    let ast = wrap_nfs_predicates(resolved, config);
    Ok(CompiledExpr { ast })
}

impl CompiledExpr {
    /// Evaluates the predicate against one packet; errors are non-match.
    pub fn matches(&self, pkt: &Packet, config: &MatcherConfig) -> bool {
        let env = Env::new(pkt, config);
        match eval(&self.ast, &env) {
            Ok(v) => v.truthy(),
            Err(e) => {
                trace!(index = pkt.index, error = %e, "predicate error treated as no match");
                false
            }
        }
    }
}

/// Turns parsed dotted paths into field references (multi-part) or
/// named-constant lookups (bare identifiers).
fn resolve_paths(expr: Expr) -> Expr {
    match expr {
        Expr::Path(mut path) => {
            if path.len() == 1 {
                Expr::Const(path.remove(0))
            } else {
                let layer = path.remove(0);
                Expr::Field { layer, path }
            }
        }
        Expr::List(items) => Expr::List(items.into_iter().map(resolve_paths).collect()),
        Expr::Unary(op, inner) => Expr::Unary(op, Box::new(resolve_paths(*inner))),
        Expr::Binary(op, lhs, rhs) => {
            Expr::Binary(op, Box::new(resolve_paths(*lhs)), Box::new(resolve_paths(*rhs)))
        }
        Expr::Call { name, args } => {
            Expr::Call { name, args: args.into_iter().map(resolve_paths).collect() }
        }
        Expr::ExistsNfsOp(inner) => Expr::ExistsNfsOp(Box::new(resolve_paths(*inner))),
        other => other,
    }
}

/// True when the subtree reads an NFS field that belongs to individual
/// compound operations rather than to the compound itself.
fn mentions_nfs_op_field(expr: &Expr, config: &MatcherConfig) -> bool {
    match expr {
        Expr::Field { layer, path } => {
            layer.eq_ignore_ascii_case("nfs")
                && path.first().is_some_and(|f| !config.nfs_compound_attrs.contains(f))
        }
        Expr::List(items) => items.iter().any(|e| mentions_nfs_op_field(e, config)),
        Expr::Unary(_, inner) | Expr::ExistsNfsOp(inner) => mentions_nfs_op_field(inner, config),
        Expr::Binary(_, lhs, rhs) => {
            mentions_nfs_op_field(lhs, config) || mentions_nfs_op_field(rhs, config)
        }
        Expr::Call { args, .. } => args.iter().any(|e| mentions_nfs_op_field(e, config)),
        _ => false,
    }
}

/// Wraps each atomic predicate that touches per-operation NFS fields in
/// an exists-over-operations node. The boolean structure above the
/// atoms is preserved, so `NFS.argop == 38 and NFS.argop == 9` asks for
/// a compound containing both operations (in any of its ops each).
fn wrap_nfs_predicates(expr: Expr, config: &MatcherConfig) -> Expr {
    match expr {
        Expr::Binary(op, lhs, rhs) if matches!(op, BinOp::And | BinOp::Or) => {
            Expr::Binary(
                op,
                Box::new(wrap_nfs_predicates(*lhs, config)),
                Box::new(wrap_nfs_predicates(*rhs, config)),
            )
        }
        Expr::Unary(UnaryOp::Not, inner) => {
            Expr::Unary(UnaryOp::Not, Box::new(wrap_nfs_predicates(*inner, config)))
        }
        other => {
            if mentions_nfs_op_field(&other, config) {
                Expr::ExistsNfsOp(Box::new(other))
            } else {
                other
            }
        }
    }
}
