use std::collections::HashMap;

use super::{Directive, DirectiveId, FunctionDecl, Stmt, TranslationUnit, VarDecl, VarId};
use crate::error::CodegenError;
use crate::span::Span;

/// Where a directive sits in the unit.
#[derive(Debug, Clone, Copy)]
pub struct DirectiveInfo<'a> {
    pub directive: &'a Directive,
    /// Innermost enclosing directive, if any.
    pub parent: Option<DirectiveId>,
    /// Function whose body contains the directive.
    pub function: &'a str,
}

/// Lookup tables over a translation unit, built once per compilation.
pub struct UnitIndex<'a> {
    unit: &'a TranslationUnit,
    vars: HashMap<VarId, &'a VarDecl>,
    functions: HashMap<&'a str, &'a FunctionDecl>,
    directives: HashMap<DirectiveId, DirectiveInfo<'a>>,
}

impl<'a> UnitIndex<'a> {
    pub fn build(unit: &'a TranslationUnit) -> Result<Self, CodegenError> {
        let vars = unit.vars.iter().map(|v| (v.id, v)).collect();

        let mut functions = HashMap::new();
        for f in &unit.functions {
            if functions.insert(f.name.as_str(), f).is_some() {
                return Err(CodegenError::DuplicateFunction {
                    name: f.name.clone(),
                    span: f.span,
                });
            }
        }

        let mut directives = HashMap::new();
        for f in &unit.functions {
            index_directives(&f.body, None, &f.name, &mut directives)?;
        }

        Ok(Self {
            unit,
            vars,
            functions,
            directives,
        })
    }

    pub fn unit(&self) -> &'a TranslationUnit {
        self.unit
    }

    pub fn var(&self, id: VarId, span: Span) -> Result<&'a VarDecl, CodegenError> {
        self.vars
            .get(&id)
            .copied()
            .ok_or(CodegenError::UnknownVar { id: id.0, span })
    }

    pub fn function(&self, name: &str) -> Option<&'a FunctionDecl> {
        self.functions.get(name).copied()
    }

    pub fn directive(&self, id: DirectiveId) -> Option<&DirectiveInfo<'a>> {
        self.directives.get(&id)
    }

    /// Device functions in declaration order.
    pub fn device_functions(&self) -> impl Iterator<Item = &'a FunctionDecl> {
        self.unit.functions.iter().filter(|f| f.device)
    }

    /// Target regions of host functions, in source order.
    pub fn target_regions(&self) -> Vec<(&'a FunctionDecl, &'a Directive)> {
        let mut out = Vec::new();
        for f in self.unit.functions.iter().filter(|f| !f.device) {
            collect_targets(&f.body, f, &mut out);
        }
        out
    }
}

fn index_directives<'a>(
    stmt: &'a Stmt,
    parent: Option<DirectiveId>,
    function: &'a str,
    out: &mut HashMap<DirectiveId, DirectiveInfo<'a>>,
) -> Result<(), CodegenError> {
    let mut found = Vec::new();
    stmt.for_each_directive(&mut |d| found.push(d));
    for d in found {
        let info = DirectiveInfo {
            directive: d,
            parent,
            function,
        };
        if out.insert(d.id, info).is_some() {
            return Err(CodegenError::DuplicateDirective {
                id: d.id.0,
                span: d.span,
            });
        }
        index_directives(&d.body, Some(d.id), function, out)?;
    }
    Ok(())
}

fn collect_targets<'a>(
    stmt: &'a Stmt,
    func: &'a FunctionDecl,
    out: &mut Vec<(&'a FunctionDecl, &'a Directive)>,
) {
    let mut found = Vec::new();
    stmt.for_each_directive(&mut |d| found.push(d));
    for d in found {
        if d.kind.is_target() {
            out.push((func, d));
        } else {
            collect_targets(&d.body, func, out);
        }
    }
}
