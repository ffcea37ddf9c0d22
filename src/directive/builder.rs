//! Programmatic construction of directive trees.

use super::{
    Directive, DirectiveId, DirectiveKind, FunctionDecl, Stmt, Storage, TranslationUnit, Ty,
    VarDecl, VarId,
};
use crate::span::Span;

/// Hands out variable and directive ids and collects declarations.
#[derive(Default)]
pub struct UnitBuilder {
    unit: TranslationUnit,
    next_var: u32,
    next_directive: u32,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, path: impl Into<String>) -> Self {
        self.unit.source = Some(path.into());
        self
    }

    pub fn var(&mut self, name: &str, ty: Ty) -> VarId {
        self.var_with(name, ty, Storage::Local)
    }

    /// A reference variable (`int &r`, or a pointer-typed parameter).
    pub fn reference(&mut self, name: &str, ty: Ty) -> VarId {
        self.var_with(name, ty, Storage::Reference)
    }

    /// A typed view over storage of another type.
    pub fn view(&mut self, name: &str, ty: Ty, underlying: Ty) -> VarId {
        self.var_with(name, ty, Storage::View { underlying })
    }

    pub fn var_with(&mut self, name: &str, ty: Ty, storage: Storage) -> VarId {
        let id = VarId(self.next_var);
        self.next_var += 1;
        self.unit.vars.push(VarDecl {
            id,
            name: name.to_string(),
            ty,
            storage,
        });
        id
    }

    /// A directive with a fresh id and an empty body.
    pub fn directive(&mut self, kind: DirectiveKind) -> Directive {
        let id = DirectiveId(self.next_directive);
        self.next_directive += 1;
        Directive {
            id,
            kind,
            captures: Vec::new(),
            locals: Vec::new(),
            body: Stmt::empty(),
            clauses: Default::default(),
            span: Span::dummy(),
        }
    }

    /// A host function: only its target regions are compiled for the device.
    pub fn host_function(&mut self, name: &str, locals: Vec<VarId>, body: Stmt) -> &mut FunctionDecl {
        self.push_function(name, Vec::new(), locals, false, body)
    }

    /// A device (declare target) function.
    pub fn device_function(
        &mut self,
        name: &str,
        params: Vec<VarId>,
        locals: Vec<VarId>,
        body: Stmt,
    ) -> &mut FunctionDecl {
        self.push_function(name, params, locals, true, body)
    }

    fn push_function(
        &mut self,
        name: &str,
        params: Vec<VarId>,
        locals: Vec<VarId>,
        device: bool,
        body: Stmt,
    ) -> &mut FunctionDecl {
        self.unit.functions.push(FunctionDecl {
            name: name.to_string(),
            params,
            locals,
            has_this: false,
            device,
            body,
            span: Span::dummy(),
        });
        let last = self.unit.functions.len() - 1;
        &mut self.unit.functions[last]
    }

    pub fn finish(self) -> TranslationUnit {
        self.unit
    }
}
