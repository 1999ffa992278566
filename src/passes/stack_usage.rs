// This module implements the stack-usage computation. A function's private frame holds its
// allocas, each placed at the next offset aligned for the allocated type. The stack amount
// of a function is its own frame plus the deepest amount among its callees, since a callee
// frame starts where the caller's ends. Amounts are computed by a depth-first walk over the
// call graph. A function that sits on a call cycle, reaches one, or calls a function without
// a body has no representable amount: it receives no StackAmount annotation (any earlier one
// is removed) and lowering reports it as a per-kernel failure. Without a module data layout
// the default little-endian 64-bit layout sizes the frames.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::ALL_ANALYSES;
use crate::core::CompileResult;
use crate::ir::{Constant, DataLayout, FuncId, Function, InstId, Module, Opcode, Type, Value};
use crate::metadata::{Annotation, AnnotationKind, EntityId};
use hashbrown::HashMap;
use log::{debug, warn};

pub const NAME: &str = "compute-stack-usage";

pub struct ComputeStackUsage;

/// Placement of a function's allocas in its private frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub offsets: HashMap<InstId, u64>,
    pub size: u64,
}

impl FrameLayout {
    pub fn compute(func: &Function, dl: &DataLayout) -> Self {
        let mut layout = FrameLayout::default();
        for (_, id) in func.live_insts() {
            let inst = func.inst(id);
            if inst.op != Opcode::Alloca {
                continue;
            }
            let ty = allocated_type(&inst.operands[0]);
            let align = dl.abi_align(&ty);
            let offset = layout.size.div_ceil(align) * align;
            layout.offsets.insert(id, offset);
            layout.size = offset + dl.alloc_size(&ty);
        }
        layout
    }
}

fn allocated_type(operand: &Value) -> Type {
    match operand {
        Value::Const(Constant::Undef(ty)) => ty.clone(),
        Value::Const(c) => c.ty(),
        _ => Type::I8,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done(Option<u64>),
}

struct StackWalker<'m> {
    module: &'m Module,
    dl: DataLayout,
    state: HashMap<FuncId, Visit>,
}

impl StackWalker<'_> {
    fn amount(&mut self, id: FuncId) -> Option<u64> {
        match self.state.get(&id) {
            Some(Visit::Done(amount)) => return *amount,
            Some(Visit::InProgress) => {
                warn!("'{}' is recursive, stack usage is unknown", self.module.func(id).name);
                return None;
            }
            None => {}
        }
        let func = self.module.func(id);
        if func.is_declaration() {
            self.state.insert(id, Visit::Done(None));
            return None;
        }
        self.state.insert(id, Visit::InProgress);

        let own = FrameLayout::compute(func, &self.dl).size;
        let callees: Vec<Option<FuncId>> = func
            .live_insts()
            .map(|(_, i)| func.inst(i))
            .filter(|inst| inst.op == Opcode::Call)
            .map(|inst| inst.callee)
            .collect();
        let mut deepest = Some(0u64);
        for callee in callees {
            let callee_amount = match callee {
                Some(c) => self.amount(c),
                None => None,
            };
            deepest = match (deepest, callee_amount) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
        }
        let amount = deepest.map(|d| own + d);
        self.state.insert(id, Visit::Done(amount));
        amount
    }
}

impl Pass for ComputeStackUsage {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Module, requires: &[], preserves: ALL_ANALYSES }
    }

    fn run(&mut self, _unit: PassUnit, module: &mut Module, ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let module: &Module = module;
        let mut walker =
            StackWalker { module, dl: module.data_layout.unwrap_or_default(), state: HashMap::new() };
        let mut changed = false;
        for id in module.func_ids() {
            if module.func(id).is_declaration() {
                continue;
            }
            let entity = EntityId::Function(id);
            match walker.amount(id) {
                Some(amount) => {
                    debug!("'{}' needs {} byte(s) of private stack", module.func(id).name, amount);
                    let previous = ctx.annotations.insert(entity, Annotation::StackAmount(amount));
                    changed |= previous != Some(Annotation::StackAmount(amount));
                }
                None => {
                    warn!("stack usage of '{}' cannot be represented", module.func(id).name);
                    changed |= ctx.annotations.remove(entity, AnnotationKind::StackAmount).is_some();
                }
            }
        }
        Ok(PassResult::from_changed(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CompileOptions;
    use crate::ir::parse_module;
    use crate::metadata::AnnotationTable;
    use crate::passes::with_test_context;

    fn amounts(src: &str) -> (Module, AnnotationTable) {
        let mut module = parse_module("t", src).unwrap();
        let mut options = CompileOptions::new();
        let mut annotations = AnnotationTable::new();
        with_test_context(&mut options, &mut annotations, |ctx| {
            ComputeStackUsage.run(PassUnit::Module, &mut module, ctx).unwrap();
        });
        (module, annotations)
    }

    #[test]
    fn frames_are_aligned_and_callees_stack_up() {
        let (module, table) = amounts(
            "func @leaf() {
            entry:
              %a = alloca i8
              %b = alloca [3 x i32]
              ret
            }
            func @mid() {
            entry:
              %c = alloca i64
              call @leaf()
              ret
            }
            kernel @k() {
            entry:
              %d = alloca i16
              call @mid()
              call @leaf()
              ret
            }",
        );
        let leaf = module.function_by_name("leaf").unwrap();
        let layout = FrameLayout::compute(module.func(leaf), &DataLayout::default());
        assert_eq!(layout.offsets[&InstId(1)], 4);
        assert_eq!(table.stack_amount(leaf), Some(16));
        assert_eq!(table.stack_amount(module.function_by_name("mid").unwrap()), Some(24));
        assert_eq!(table.stack_amount(module.function_by_name("k").unwrap()), Some(26));
    }

    #[test]
    fn recursion_and_external_calls_have_no_amount() {
        let (module, table) = amounts(
            "declare @ext()
            func @self_rec() {
            entry:
              call @self_rec()
              ret
            }
            kernel @a() {
            entry:
              call @self_rec()
              ret
            }
            kernel @b() {
            entry:
              call @ext()
              ret
            }
            kernel @c() {
            entry:
              ret
            }",
        );
        for name in ["self_rec", "a", "b"] {
            assert_eq!(table.stack_amount(module.function_by_name(name).unwrap()), None, "{name}");
        }
        assert_eq!(table.stack_amount(module.function_by_name("c").unwrap()), Some(0));
    }
}
