// This module implements the pass that drops the bundled device-library assert handler.
// A definition of `__devicelib_assert_fail` loses its body and stays behind as a
// declaration, so the runtime's own handler is linked in its place. A declaration of that
// name, or a module without it, is left untouched.

use super::{Pass, PassContext, PassDescriptor, PassResult, PassScope, PassUnit};
use crate::core::CompileResult;
use crate::ir::Module;
use log::debug;

pub const NAME: &str = "prune-devicelib-assert";

/// Reserved name of the device-library assert handler.
pub const DEVICELIB_ASSERT_FAIL: &str = "__devicelib_assert_fail";

pub struct PruneDevicelibAssert;

impl Pass for PruneDevicelibAssert {
    fn descriptor(&self) -> PassDescriptor {
        PassDescriptor { name: NAME, scope: PassScope::Module, requires: &[], preserves: &[] }
    }

    fn run(&mut self, _unit: PassUnit, module: &mut Module, _ctx: &mut PassContext<'_, '_>) -> CompileResult<PassResult> {
        let Some(id) = module.function_by_name(DEVICELIB_ASSERT_FAIL) else {
            return Ok(PassResult::Unchanged);
        };
        let func = module.func_mut(id);
        if func.is_declaration() {
            return Ok(PassResult::Unchanged);
        }
        func.delete_body();
        debug!("removed the body of {}", DEVICELIB_ASSERT_FAIL);
        Ok(PassResult::Changed)
    }
}
