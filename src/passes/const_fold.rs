// This module implements the folding of loads from predefined constants. A global is a
// candidate when it is marked constant and its initializer is the one every reader sees
// (it has one and cannot be replaced at link time). A load is foldable when its address is
// the global itself or a chain of ptradds with constant offsets on top of it. The folded
// value is read from the initializer's bytes, serialized with the module data layout, at the
// load's byte offset; the load's uses are rewritten to the constant and the load is removed.
// Folding without a data layout would guess at byte order and type sizes, so a candidate
// load in a module without one is an error rather than a silent skip. Reads that fall
// outside the initializer, and loads of pointer or aggregate type, are left alone. Block
// structure never changes, so the CFG analyses survive.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::analysis::CFG_ANALYSES;
use crate::core::{CompileError, CompileResult};
use crate::ir::{Constant, DataLayout, Function, GlobalId, InstId, Module, Opcode, Type, Value};
use hashbrown::HashMap;
use log::{debug, trace};

pub const NAME: &str = "fold-predefined-constants";

pub struct FoldPredefinedConstants;

/// A load whose address is `global + offset`.
struct CandidateLoad {
    inst: InstId,
    global: GlobalId,
    offset: i64,
}

impl Pass for FoldPredefinedConstants {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Module, requires: &[], preserves: CFG_ANALYSES }
    }

    fn run(&mut self, _unit: PassUnit, module: &mut Module, _ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let candidates: Vec<GlobalId> = (0..module.globals.len() as u32)
            .map(GlobalId)
            .filter(|g| {
                let global = module.global(*g);
                global.is_constant && global.has_unique_initializer()
            })
            .collect();
        if candidates.is_empty() {
            return Ok(PassResult::Unchanged);
        }

        let mut per_function = Vec::new();
        for id in module.func_ids() {
            let loads = candidate_loads(module.func(id), &candidates);
            if !loads.is_empty() {
                per_function.push((id, loads));
            }
        }
        if per_function.is_empty() {
            return Ok(PassResult::Unchanged);
        }
        let dl = module.data_layout.ok_or(CompileError::MissingDataLayout { pass: NAME })?;

        let mut images: HashMap<GlobalId, Vec<u8>> = HashMap::new();
        for g in &candidates {
            if let Some(init) = &module.global(*g).initializer {
                let mut bytes = Vec::new();
                init.write_bytes(&dl, &mut bytes);
                images.insert(*g, bytes);
            }
        }

        let mut folded = 0;
        for (id, loads) in per_function {
            let func = module.func_mut(id);
            for load in loads {
                let Some(image) = images.get(&load.global) else { continue };
                let ty = func.inst(load.inst).ty.clone();
                let Some(value) = read_constant(&dl, image, load.offset, &ty) else {
                    trace!("'{}': load {} at offset {} not foldable", func.name, load.inst, load.offset);
                    continue;
                };
                func.replace_all_uses(&Value::Inst(load.inst), &Value::Const(value));
                func.erase_inst(load.inst);
                folded += 1;
            }
        }
        debug!("folded {} load(s) from predefined constants", folded);
        Ok(PassResult::from_changed(folded > 0))
    }
}

fn candidate_loads(func: &Function, candidates: &[GlobalId]) -> Vec<CandidateLoad> {
    func.live_insts()
        .filter(|(_, id)| func.inst(*id).op == Opcode::Load)
        .filter_map(|(_, id)| {
            let (global, offset) = resolve_address(func, &func.inst(id).operands[0])?;
            candidates.contains(&global).then_some(CandidateLoad { inst: id, global, offset })
        })
        .collect()
}

/// Split an address into a global and a constant byte offset.
fn resolve_address(func: &Function, addr: &Value) -> Option<(GlobalId, i64)> {
    match addr {
        Value::Global(g) => Some((*g, 0)),
        Value::Inst(id) => {
            let inst = func.inst(*id);
            if inst.op != Opcode::PtrAdd {
                return None;
            }
            let (global, base) = resolve_address(func, &inst.operands[0])?;
            let offset = match inst.operands[1].as_const()? {
                Constant::Scalar { ty, bits } if !ty.is_float() => {
                    let shift = 64 - ty.bits();
                    ((*bits << shift) as i64) >> shift
                }
                _ => return None,
            };
            Some((global, base.checked_add(offset)?))
        }
        _ => None,
    }
}

/// Read a value of type `ty` at `offset` from a serialized initializer.
fn read_constant(dl: &DataLayout, image: &[u8], offset: i64, ty: &Type) -> Option<Constant> {
    let start = usize::try_from(offset).ok()?;
    let size = dl.store_size(ty) as usize;
    let bytes = image.get(start..start.checked_add(size)?)?;
    match ty {
        Type::Scalar(s) => Some(Constant::Scalar { ty: *s, bits: dl.read_uint(bytes) & s.mask() }),
        Type::Vector(elem, _) => {
            let lane = elem.store_bytes() as usize;
            let lanes = bytes.chunks(lane).map(|chunk| dl.read_uint(chunk) & elem.mask()).collect();
            Some(Constant::Vector { elem: *elem, lanes })
        }
        _ => None,
    }
}
