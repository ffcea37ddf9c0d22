//! Incremental construction of SIR functions.
//!
//! Structured blocks are opened and closed explicitly (`begin_if`,
//! `begin_else`, `end_if`, `begin_loop`, `end_loop`) so the caller can
//! keep mutable access to its own state while filling a block. Allocas
//! are hoisted to the function entry regardless of where they are
//! requested.

use super::{
    BinOp, Callee, CmpOp, Function, Linkage, Param, Reg, SIROp, Special, Value, Width,
};
use crate::abi::RuntimeFn;

enum OpenKind {
    If {
        cond: Value,
        then_body: Option<Vec<SIROp>>,
    },
    Loop {
        label: String,
    },
}

struct OpenBlock {
    kind: OpenKind,
    ops: Vec<SIROp>,
}

pub struct FnBuilder {
    name: String,
    params: Vec<Param>,
    returns: Option<Width>,
    linkage: Linkage,
    noinline: bool,
    next_reg: u32,
    allocas: Vec<SIROp>,
    body: Vec<SIROp>,
    open: Vec<OpenBlock>,
}

impl FnBuilder {
    pub fn new(name: impl Into<String>, linkage: Linkage) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            returns: None,
            linkage,
            noinline: false,
            next_reg: 0,
            allocas: Vec::new(),
            body: Vec::new(),
            open: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn set_returns(&mut self, width: Width) {
        self.returns = Some(width);
    }

    pub fn set_noinline(&mut self) {
        self.noinline = true;
    }

    pub fn param(&mut self, name: impl Into<String>, width: Width) -> Reg {
        let reg = self.fresh();
        self.params.push(Param {
            reg,
            name: name.into(),
            width,
        });
        reg
    }

    pub fn fresh(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    /// Depth of currently open structured blocks.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn emit(&mut self, op: SIROp) {
        match self.open.last_mut() {
            Some(block) => block.ops.push(op),
            None => self.body.push(op),
        }
    }

    // ── memory ──

    pub fn alloca(&mut self, name: impl Into<String>, size: u32, align: u32) -> Reg {
        let dst = self.fresh();
        self.allocas.push(SIROp::Alloca {
            dst,
            size: size.max(1),
            align: align.max(1),
            name: name.into(),
        });
        dst
    }

    pub fn load(&mut self, addr: impl Into<Value>, width: Width) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::Load {
            dst,
            addr: addr.into(),
            width,
        });
        dst
    }

    pub fn store(&mut self, value: impl Into<Value>, addr: impl Into<Value>, width: Width) {
        self.emit(SIROp::Store {
            value: value.into(),
            addr: addr.into(),
            width,
        });
    }

    pub fn field_addr(&mut self, base: impl Into<Value>, offset: u32) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::FieldAddr {
            dst,
            base: base.into(),
            offset,
            index: None,
        });
        dst
    }

    pub fn elem_addr(
        &mut self,
        base: impl Into<Value>,
        offset: u32,
        index: impl Into<Value>,
        stride: u32,
    ) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::FieldAddr {
            dst,
            base: base.into(),
            offset,
            index: Some((index.into(), stride)),
        });
        dst
    }

    // ── arithmetic ──

    pub fn binary(&mut self, op: BinOp, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::Binary {
            dst,
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    pub fn compare(&mut self, op: CmpOp, lhs: impl Into<Value>, rhs: impl Into<Value>) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::Compare {
            dst,
            op,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    pub fn popcount(&mut self, src: impl Into<Value>) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::PopCount {
            dst,
            src: src.into(),
        });
        dst
    }

    pub fn special(&mut self, reg: Special) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::Special { dst, reg });
        dst
    }

    pub fn barrier(&mut self) {
        self.emit(SIROp::Barrier);
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.emit(SIROp::Comment(text.into()));
    }

    // ── calls ──

    pub fn call(&mut self, callee: Callee, args: Vec<Value>) -> Reg {
        let dst = self.fresh();
        self.emit(SIROp::Call {
            dst: Some(dst),
            callee,
            args,
        });
        dst
    }

    pub fn call_void(&mut self, callee: Callee, args: Vec<Value>) {
        self.emit(SIROp::Call {
            dst: None,
            callee,
            args,
        });
    }

    /// Call a runtime entry point that returns a value.
    pub fn rt_call(&mut self, rt: RuntimeFn, args: Vec<Value>) -> Reg {
        debug_assert_eq!(args.len(), rt.arity(), "{}", rt);
        debug_assert!(rt.has_result(), "{}", rt);
        self.call(Callee::Runtime(rt), args)
    }

    pub fn rt_call_void(&mut self, rt: RuntimeFn, args: Vec<Value>) {
        debug_assert_eq!(args.len(), rt.arity(), "{}", rt);
        self.call_void(Callee::Runtime(rt), args);
    }

    pub fn ret(&mut self, value: Option<Value>) {
        self.emit(SIROp::Return(value));
    }

    // ── structure ──

    pub fn begin_if(&mut self, cond: impl Into<Value>) {
        self.open.push(OpenBlock {
            kind: OpenKind::If {
                cond: cond.into(),
                then_body: None,
            },
            ops: Vec::new(),
        });
    }

    pub fn begin_else(&mut self) {
        let block = self.open.last_mut().expect("begin_else outside of an if");
        match &mut block.kind {
            OpenKind::If { then_body, .. } if then_body.is_none() => {
                *then_body = Some(std::mem::take(&mut block.ops));
            }
            _ => panic!("begin_else without a matching begin_if"),
        }
    }

    pub fn end_if(&mut self) {
        let block = self.open.pop().expect("end_if outside of an if");
        let OpenKind::If { cond, then_body } = block.kind else {
            panic!("end_if closes a loop");
        };
        let (then_body, else_body) = match then_body {
            Some(then_body) => (then_body, block.ops),
            None => (block.ops, Vec::new()),
        };
        self.emit(SIROp::If {
            cond,
            then_body,
            else_body,
        });
    }

    pub fn begin_loop(&mut self, label: impl Into<String>) {
        self.open.push(OpenBlock {
            kind: OpenKind::Loop {
                label: label.into(),
            },
            ops: Vec::new(),
        });
    }

    pub fn end_loop(&mut self) {
        let block = self.open.pop().expect("end_loop outside of a loop");
        let OpenKind::Loop { label } = block.kind else {
            panic!("end_loop closes an if");
        };
        self.emit(SIROp::Loop {
            label,
            body: block.ops,
        });
    }

    pub fn break_loop(&mut self) {
        self.emit(SIROp::Break);
    }

    /// Close the function. A trailing `ret` is added when the body does
    /// not already end in one.
    pub fn finish(mut self) -> Function {
        assert!(
            self.open.is_empty(),
            "function '{}' finished with {} open blocks",
            self.name,
            self.open.len()
        );
        if !matches!(self.body.last(), Some(SIROp::Return(_))) {
            self.body.push(SIROp::Return(None));
        }
        let mut body = std::mem::take(&mut self.allocas);
        body.append(&mut self.body);
        Function {
            name: self.name,
            params: self.params,
            returns: self.returns,
            linkage: self.linkage,
            noinline: self.noinline,
            body,
            reg_count: self.next_reg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocas_are_hoisted() {
        let mut fb = FnBuilder::new("f", Linkage::Internal);
        fb.begin_loop("l");
        let a = fb.alloca("tmp", 4, 4);
        fb.store(1, a, Width::I32);
        fb.break_loop();
        fb.end_loop();
        let f = fb.finish();
        assert!(matches!(f.body[0], SIROp::Alloca { .. }));
        assert!(matches!(f.body[1], SIROp::Loop { .. }));
        assert!(matches!(f.body.last(), Some(SIROp::Return(None))));
    }

    #[test]
    fn test_if_without_else() {
        let mut fb = FnBuilder::new("f", Linkage::Internal);
        let c = fb.special(Special::ThreadId);
        fb.begin_if(c);
        fb.barrier();
        fb.end_if();
        let f = fb.finish();
        match &f.body[1] {
            SIROp::If {
                then_body,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 1);
                assert!(else_body.is_empty());
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_if_else_chain() {
        let mut fb = FnBuilder::new("f", Linkage::Internal);
        fb.begin_if(1);
        fb.comment("a");
        fb.begin_else();
        fb.begin_if(0);
        fb.comment("b");
        fb.begin_else();
        fb.comment("c");
        fb.end_if();
        fb.end_if();
        assert_eq!(fb.depth(), 0);
        let text = fb.finish().to_string();
        assert!(text.contains("; a"));
        assert!(text.contains("; c"));
        assert_eq!(text.matches("} else {").count(), 2);
    }

    #[test]
    fn test_params_take_first_registers() {
        let mut fb = FnBuilder::new("g", Linkage::Helper);
        let p0 = fb.param("src", Width::I32);
        let p1 = fb.param("lane", Width::Ptr);
        let r = fb.fresh();
        assert_eq!((p0, p1, r), (Reg(0), Reg(1), Reg(2)));
        let f = fb.finish();
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.reg_count, 3);
    }

    #[test]
    #[should_panic(expected = "open blocks")]
    fn test_finish_with_open_block_panics() {
        let mut fb = FnBuilder::new("h", Linkage::Internal);
        fb.begin_loop("l");
        fb.finish();
    }
}
