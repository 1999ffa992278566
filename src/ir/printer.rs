//! Textual form of the kernel graph. The output reparses to an equivalent module.

use super::*;
use std::fmt::{self, Write};

fn write_scalar(f: &mut impl Write, ty: ScalarType, bits: u64) -> fmt::Result {
    if ty.is_float() {
        return write!(f, "{} {:#x}", ty.name(), bits);
    }
    if ty == ScalarType::I1 {
        return write!(f, "i1 {}", bits & 1);
    }
    let shift = 64 - ty.bits();
    let signed = ((bits << shift) as i64) >> shift;
    write!(f, "{} {}", ty.name(), signed)
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Scalar { ty, bits } => write_scalar(f, *ty, *bits),
            Constant::Vector { elem, lanes } => {
                f.write_char('<')?;
                for (i, lane) in lanes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_scalar(f, *elem, *lane)?;
                }
                f.write_char('>')
            }
            Constant::Array { elems, .. } => {
                f.write_char('[')?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{e}")?;
                }
                f.write_char(']')
            }
            Constant::Zero(ty) => write!(f, "zeroinit {ty}"),
            Constant::Undef(ty) => write!(f, "undef {ty}"),
        }
    }
}

impl fmt::Display for LoopHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopHint::UnrollEnable => f.write_str("unroll.enable"),
            LoopHint::UnrollFull => f.write_str("unroll.full"),
            LoopHint::UnrollCount(n) => write!(f, "unroll.count={n}"),
            LoopHint::UnrollDisable => f.write_str("unroll.disable"),
            LoopHint::MustProgress => f.write_str("mustprogress"),
        }
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Linkage::External => "external",
            Linkage::Internal => "internal",
            Linkage::Weak => "weak",
        })
    }
}

struct FunctionPrinter<'a> {
    module: &'a Module,
    func: &'a Function,
}

impl FunctionPrinter<'_> {
    fn value_name(&self, id: InstId) -> String {
        match &self.func.inst(id).name {
            Some(name) => format!("%{name}"),
            None => format!("%_{}", id.0),
        }
    }

    fn write_value(&self, f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
        match value {
            Value::Inst(id) => f.write_str(&self.value_name(*id)),
            Value::Arg(i) => write!(f, "%{}", self.func.params[*i as usize].name),
            Value::Const(c) => write!(f, "{c}"),
            Value::Global(g) => write!(f, "@{}", self.module.global(*g).name),
        }
    }

    fn block_ref(&self, id: BlockId) -> String {
        format!("^{}", self.func.block(id).name)
    }

    fn write_inst(&self, f: &mut fmt::Formatter<'_>, id: InstId) -> fmt::Result {
        let inst = self.func.inst(id);
        f.write_str("  ")?;
        if !inst.ty.is_void() {
            write!(f, "{} = ", self.value_name(id))?;
        }
        f.write_str(inst.op.mnemonic())?;
        if let Opcode::Cmp(pred) = inst.op {
            write!(f, ".{}", pred.name())?;
        }

        match inst.op {
            Opcode::Br => write!(f, " {}", self.block_ref(inst.blocks[0]))?,
            Opcode::CondBr => {
                f.write_char(' ')?;
                self.write_value(f, &inst.operands[0])?;
                write!(f, ", {}, {}", self.block_ref(inst.blocks[0]), self.block_ref(inst.blocks[1]))?;
            }
            Opcode::Phi => {
                for (i, (value, block)) in inst.operands.iter().zip(&inst.blocks).enumerate() {
                    f.write_str(if i == 0 { " [" } else { ", [" })?;
                    self.write_value(f, value)?;
                    write!(f, ", {}]", self.block_ref(*block))?;
                }
            }
            Opcode::Call => {
                let callee = inst.callee.map(|c| self.module.func(c).name.as_str()).unwrap_or("?");
                write!(f, " @{callee}(")?;
                for (i, op) in inst.operands.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.write_value(f, op)?;
                }
                f.write_char(')')?;
                if inst.call_attrs.no_inline {
                    f.write_str(" noinline")?;
                }
                if inst.call_attrs.always_inline {
                    f.write_str(" alwaysinline")?;
                }
            }
            Opcode::Alloca => {
                if let Some(c) = inst.operands.first().and_then(Value::as_const) {
                    write!(f, " {}", c.ty())?;
                }
            }
            _ => {
                for (i, op) in inst.operands.iter().enumerate() {
                    f.write_str(if i == 0 { " " } else { ", " })?;
                    self.write_value(f, op)?;
                }
            }
        }

        if !inst.ty.is_void() && inst.op != Opcode::Alloca {
            write!(f, " : {}", inst.ty)?;
        }
        if let Some(md) = &inst.loop_md {
            f.write_str(" !loop(")?;
            for (i, hint) in md.hints.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{hint}")?;
            }
            f.write_char(')')?;
        }
        f.write_char('\n')
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dl) = &self.data_layout {
            let order = match dl.endian {
                Endian::Little => "little",
                Endian::Big => "big",
            };
            writeln!(f, "target {order} ptr{}", dl.pointer_bits)?;
        }
        for g in &self.globals {
            write!(f, "global @{} : {}", g.name, g.ty)?;
            if g.address_space != addrspace::GLOBAL {
                write!(f, " addrspace {}", g.address_space)?;
            }
            write!(f, " {} {}", if g.is_constant { "constant" } else { "var" }, g.linkage)?;
            match &g.initializer {
                Some(Constant::Zero(_)) => f.write_str(" = zeroinit")?,
                Some(Constant::Undef(_)) => f.write_str(" = undef")?,
                Some(init) => write!(f, " = {init}")?,
                None => {}
            }
            f.write_char('\n')?;
        }

        for func in &self.functions {
            f.write_char('\n')?;
            let keyword = match (func.is_kernel(), func.is_declaration()) {
                (true, _) => "kernel",
                (false, true) => "declare",
                (false, false) => "func",
            };
            write!(f, "{keyword} @{}(", func.name)?;
            for (i, p) in func.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "%{}: {}", p.name, p.ty)?;
            }
            f.write_char(')')?;
            if !func.ret_ty.is_void() {
                write!(f, " -> {}", func.ret_ty)?;
            }
            if let Some(simd) = func.simd {
                write!(f, " simd{simd}")?;
            }
            if func.attrs.no_inline {
                f.write_str(" noinline")?;
            }
            if func.attrs.always_inline {
                f.write_str(" alwaysinline")?;
            }
            if func.is_declaration() && !func.is_kernel() {
                f.write_char('\n')?;
                continue;
            }

            f.write_str(" {\n")?;
            let printer = FunctionPrinter { module: self, func };
            for block in &func.blocks {
                writeln!(f, "{}:", block.name)?;
                for id in &block.insts {
                    printer.write_inst(f, *id)?;
                }
            }
            f.write_str("}\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "target little ptr64
global @lut : [3 x i16] addrspace 2 constant internal = [i16 1, i16 -2, i16 3]
global @z : <2 x f32> var external = zeroinit

declare @ext(%x: i32) -> i32

func @helper(%a: i32) -> i32 noinline {
entry:
  %r = call @ext(%a) alwaysinline : i32
  ret %r
}

kernel @k(%out: ptr1, %n: i32) simd16 {
entry:
  %p = alloca [4 x i32]
  %lid = lane_id : i32
  br ^loop
loop:
  %i = phi [i32 0, ^entry], [%next, ^loop] : i32
  %next = add %i, i32 1 : i32
  %c = cmp.lt %next, %n : i1
  condbr %c, ^loop, ^exit !loop(unroll.count=4, mustprogress)
exit:
  %f = add f32 0x3fc00000, f32 0x0 : f32
  store %lid, %out
  ret
}
";

    #[test]
    fn printed_module_reparses_identically() {
        let module = parse_module("m", SOURCE).unwrap();
        let printed = module.to_string();
        assert_eq!(printed, SOURCE);
        let reparsed = parse_module("m", &printed).unwrap();
        assert_eq!(reparsed, module);
    }

    #[test]
    fn unnamed_values_get_stable_names() {
        let mut module = Module::new("m");
        let mut f = Function::new("f", FunctionKind::Function, vec![], Type::Void);
        let entry = f.add_block("entry");
        let a = f.push_inst(entry, Inst::new(Opcode::LaneId, Type::I32, vec![]));
        f.push_inst(entry, Inst::new(Opcode::Ret, Type::Void, vec![]));
        module.add_function(f);
        let text = module.to_string();
        assert!(text.contains(&format!("%_{} = lane_id : i32", a.0)), "{text}");
        assert!(parse_module("m", &text).is_ok());
    }
}
