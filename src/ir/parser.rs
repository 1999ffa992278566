//! Parser for the textual kernel graph form (`.kir`).
//!
//! ```text
//! ; comments start with a semicolon
//! target little ptr64
//! global @lut : [2 x i32] addrspace 2 constant internal = [i32 7, i32 9]
//! declare @ext(%x: i32) -> i32
//!
//! kernel @k(%out: ptr1, %n: i32) simd16 {
//! entry:
//!   %lid = lane_id : i32
//!   %c = cmp.lt %lid, %n : i1
//!   condbr %c, ^body, ^exit
//! body:
//!   %v = load @lut : i32
//!   store %v, %out
//!   br ^exit !loop(unroll.count=4)
//! exit:
//!   ret
//! }
//! ```
//!
//! Values, blocks, globals and callees may be referenced before they are
//! defined; references are resolved once the enclosing scope is complete.

use super::*;
use crate::core::error::{CompileError, CompileResult};
use hashbrown::HashMap;

/// Parse a module from its textual form.
pub fn parse_module(name: &str, text: &str) -> CompileResult<Module> {
    let mut parser = Parser::new(text);
    match parser.parse() {
        Ok(mut module) => {
            module.name = name.to_string();
            Ok(module)
        }
        Err(message) => Err(CompileError::Parse { line: parser.line(), message }),
    }
}

type PResult<T> = Result<T, String>;

const PENDING: u32 = u32::MAX;

struct Resolve<'a> {
    name: &'a str,
    inst: InstId,
    slot: usize,
}

struct CallResolve<'a> {
    func: FuncId,
    inst: InstId,
    callee: &'a str,
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    module: Module,

    funcs: HashMap<&'a str, FuncId>,
    call_resolves: Vec<CallResolve<'a>>,

    // Per-function state
    values: HashMap<&'a str, InstId>,
    args: HashMap<&'a str, u32>,
    blocks: HashMap<&'a str, BlockId>,
    value_resolves: Vec<Resolve<'a>>,
    block_resolves: Vec<Resolve<'a>>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            module: Module::default(),
            funcs: HashMap::new(),
            call_resolves: Vec::new(),
            values: HashMap::new(),
            args: HashMap::new(),
            blocks: HashMap::new(),
            value_resolves: Vec::new(),
            block_resolves: Vec::new(),
        }
    }

    fn line(&self) -> usize {
        self.text[..self.pos.min(self.text.len())].matches('\n').count() + 1
    }

    fn parse(&mut self) -> PResult<Module> {
        self.skip_whitespace();
        while !self.is_eof() {
            let keyword = self.read_word()?;
            match keyword {
                "target" => self.parse_target()?,
                "global" => self.parse_global()?,
                "kernel" => self.parse_function(FunctionKind::Kernel, true)?,
                "func" => self.parse_function(FunctionKind::Function, true)?,
                "declare" => self.parse_function(FunctionKind::Function, false)?,
                other => return Err(format!("unexpected top-level keyword '{other}'")),
            }
            self.skip_whitespace();
        }

        for resolve in std::mem::take(&mut self.call_resolves) {
            let callee = *self
                .funcs
                .get(resolve.callee)
                .ok_or_else(|| format!("call to undefined function '@{}'", resolve.callee))?;
            self.module.func_mut(resolve.func).inst_mut(resolve.inst).callee = Some(callee);
        }

        Ok(std::mem::take(&mut self.module))
    }

    // ---------------------------------------------------------------- lexing

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == ';' {
                while let Some(ch) = self.peek() {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn try_read_str(&mut self, s: &str) -> bool {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> PResult<()> {
        if !self.try_read(ch) {
            return Err(format!("expected '{}' but found {:?}", ch, self.peek()));
        }
        Ok(())
    }

    fn is_word_char(ch: char) -> bool {
        ch.is_alphanumeric() || ch == '_' || ch == '.'
    }

    /// Identifier-like word; dots are allowed so `cmp.lt` and `unroll.count` read as one.
    fn read_word(&mut self) -> PResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            Some(ch) => return Err(format!("expected identifier but found '{ch}'")),
            None => return Err("expected identifier but found end of input".to_string()),
        }
        while let Some(ch) = self.peek() {
            if Self::is_word_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn peek_word(&mut self) -> Option<&'a str> {
        let saved = self.pos;
        let word = self.read_word().ok();
        self.pos = saved;
        word
    }

    fn read_sigil_name(&mut self, sigil: char) -> PResult<&'a str> {
        self.expect(sigil)?;
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if Self::is_word_char(ch) {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(format!("expected a name after '{sigil}'"));
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_token(&mut self) -> PResult<&'a str> {
        self.skip_whitespace();
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || matches!(ch, '-' | '+' | '.' | '_') {
                self.advance();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(format!("expected a literal but found {:?}", self.peek()));
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_u64(&mut self) -> PResult<u64> {
        let token = self.read_token()?;
        parse_int(token).map(|v| v as u64)
    }

    // ---------------------------------------------------------------- types

    fn parse_type(&mut self) -> PResult<Type> {
        if self.try_read('<') {
            let n = self.read_u64()? as u32;
            self.expect_word("x")?;
            let elem = self.parse_scalar()?;
            self.expect('>')?;
            return Ok(Type::Vector(elem, n));
        }
        if self.try_read('[') {
            let n = self.read_u64()?;
            self.expect_word("x")?;
            let elem = self.parse_type()?;
            self.expect(']')?;
            return Ok(Type::Array(Box::new(elem), n));
        }
        let word = self.read_word()?;
        type_from_word(word).ok_or_else(|| format!("unknown type '{word}'"))
    }

    fn parse_scalar(&mut self) -> PResult<ScalarType> {
        let word = self.read_word()?;
        ScalarType::from_name(word).ok_or_else(|| format!("expected a scalar type, found '{word}'"))
    }

    fn expect_word(&mut self, expected: &str) -> PResult<()> {
        let word = self.read_word()?;
        if word != expected {
            return Err(format!("expected '{expected}' but found '{word}'"));
        }
        Ok(())
    }

    // ---------------------------------------------------------------- constants

    fn parse_scalar_literal(&mut self, ty: ScalarType) -> PResult<u64> {
        let token = self.read_token()?;
        let is_hex = token.starts_with("0x") || token.starts_with("-0x");
        if ty.is_float() && !is_hex {
            let v: f64 = token.parse().map_err(|e| format!("bad float literal '{token}': {e}"))?;
            return match ty {
                ScalarType::F32 => Ok((v as f32).to_bits() as u64),
                ScalarType::F64 => Ok(v.to_bits()),
                _ => Err(format!("{} literals must be written as raw hex bits", ty.name())),
            };
        }
        Ok(parse_int(token)? as u64 & ty.mask())
    }

    /// Constant written with its own type: `i32 5`, `<i16 1, i16 2>`, `[i32 1, i32 2]`.
    fn parse_constant(&mut self) -> PResult<Constant> {
        if self.try_read('<') {
            let mut elem = None;
            let mut lanes = Vec::new();
            loop {
                let ty = self.parse_scalar()?;
                if elem.is_some_and(|e| e != ty) {
                    return Err("vector lanes must share one element type".to_string());
                }
                elem = Some(ty);
                lanes.push(self.parse_scalar_literal(ty)?);
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect('>')?;
            let elem = elem.ok_or("empty vector constant")?;
            return Ok(Constant::Vector { elem, lanes });
        }
        if self.try_read('[') {
            let mut elems = Vec::new();
            loop {
                elems.push(self.parse_constant()?);
                if !self.try_read(',') {
                    break;
                }
            }
            self.expect(']')?;
            let elem = elems[0].ty();
            if elems.iter().any(|e| e.ty() != elem) {
                return Err("array elements must share one type".to_string());
            }
            return Ok(Constant::Array { elem, elems });
        }
        let ty = self.parse_scalar()?;
        let bits = self.parse_scalar_literal(ty)?;
        Ok(Constant::Scalar { ty, bits })
    }

    fn parse_initializer(&mut self, ty: &Type) -> PResult<Constant> {
        match self.peek_word() {
            Some("zeroinit") => {
                self.read_word()?;
                Ok(Constant::Zero(ty.clone()))
            }
            Some("undef") => {
                self.read_word()?;
                Ok(Constant::Undef(ty.clone()))
            }
            _ => {
                let init = self.parse_constant()?;
                if init.ty() != *ty {
                    return Err(format!("initializer of type {} does not match {}", init.ty(), ty));
                }
                Ok(init)
            }
        }
    }

    // ---------------------------------------------------------------- items

    fn parse_target(&mut self) -> PResult<()> {
        let endian = match self.read_word()? {
            "little" => Endian::Little,
            "big" => Endian::Big,
            other => return Err(format!("unknown byte order '{other}'")),
        };
        let ptr = self.read_word()?;
        let bits = ptr
            .strip_prefix("ptr")
            .and_then(|b| b.parse::<u32>().ok())
            .filter(|b| *b == 32 || *b == 64)
            .ok_or_else(|| format!("expected ptr32 or ptr64, found '{ptr}'"))?;
        self.module.data_layout = Some(DataLayout::new(endian, bits));
        Ok(())
    }

    fn parse_global(&mut self) -> PResult<()> {
        let name = self.read_sigil_name('@')?;
        if self.module.global_by_name(name).is_some() {
            return Err(format!("duplicate global '@{name}'"));
        }
        self.expect(':')?;
        let ty = self.parse_type()?;
        let mut address_space = addrspace::GLOBAL;
        if self.peek_word() == Some("addrspace") {
            self.read_word()?;
            address_space = self.read_u64()? as u32;
        }
        let is_constant = match self.read_word()? {
            "constant" => true,
            "var" => false,
            other => return Err(format!("expected 'constant' or 'var', found '{other}'")),
        };
        let linkage = match self.read_word()? {
            "external" => Linkage::External,
            "internal" => Linkage::Internal,
            "weak" => Linkage::Weak,
            other => return Err(format!("unknown linkage '{other}'")),
        };
        let initializer = if self.try_read('=') { Some(self.parse_initializer(&ty)?) } else { None };
        self.module.add_global(GlobalVar {
            name: name.to_string(),
            ty,
            address_space,
            is_constant,
            linkage,
            initializer,
        });
        Ok(())
    }

    fn parse_function(&mut self, kind: FunctionKind, has_body: bool) -> PResult<()> {
        let name = self.read_sigil_name('@')?;
        if self.funcs.contains_key(name) {
            return Err(format!("duplicate function '@{name}'"));
        }

        self.values.clear();
        self.args.clear();
        self.blocks.clear();
        self.value_resolves.clear();
        self.block_resolves.clear();

        self.expect('(')?;
        let mut params = Vec::new();
        if !self.try_read(')') {
            loop {
                let arg = self.read_sigil_name('%')?;
                self.expect(':')?;
                let ty = self.parse_type()?;
                self.args.insert(arg, params.len() as u32);
                params.push(Param { name: arg.to_string(), ty });
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        let ret_ty = if self.try_read_str("->") { self.parse_type()? } else { Type::Void };

        let mut func = Function::new(name, kind, params, ret_ty);
        while let Some(word) = self.peek_word() {
            match word {
                "noinline" => func.attrs.no_inline = true,
                "alwaysinline" => func.attrs.always_inline = true,
                w if w.starts_with("simd") => {
                    let width = w[4..].parse::<u32>().map_err(|_| format!("bad SIMD width '{w}'"))?;
                    func.simd = Some(width);
                }
                _ => break,
            }
            self.read_word()?;
        }

        let id = FuncId(self.module.functions.len() as u32);
        self.funcs.insert(name, id);
        self.module.functions.push(func);

        if has_body {
            self.expect('{')?;
            while !self.try_read('}') {
                self.parse_block(id)?;
            }
            if self.module.func(id).blocks.is_empty() {
                return Err(format!("function '@{name}' has an empty body"));
            }
            self.resolve_function_references(id)?;
        }
        Ok(())
    }

    fn parse_block(&mut self, func: FuncId) -> PResult<()> {
        let name = self.read_word()?;
        self.expect(':')?;
        if self.blocks.contains_key(name) {
            return Err(format!("duplicate block '{name}'"));
        }
        let block = self.module.func_mut(func).add_block(name);
        self.blocks.insert(name, block);

        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') || self.is_eof() || self.at_block_label() {
                break;
            }
            self.parse_instruction(func, block)?;
        }
        Ok(())
    }

    fn at_block_label(&mut self) -> bool {
        let saved = self.pos;
        let is_label = self.read_word().is_ok() && self.peek() == Some(':');
        self.pos = saved;
        is_label
    }

    fn parse_value(&mut self, func: FuncId, inst: InstId, slot: usize) -> PResult<Value> {
        self.skip_whitespace();
        match self.peek() {
            Some('%') => {
                let name = self.read_sigil_name('%')?;
                if let Some(arg) = self.args.get(name) {
                    return Ok(Value::Arg(*arg));
                }
                if let Some(id) = self.values.get(name) {
                    return Ok(Value::Inst(*id));
                }
                self.value_resolves.push(Resolve { name, inst, slot });
                Ok(Value::Inst(InstId(PENDING)))
            }
            Some('@') => {
                let name = self.read_sigil_name('@')?;
                let global = self
                    .module
                    .global_by_name(name)
                    .ok_or_else(|| format!("unknown global '@{name}' in {}", self.module.func(func).name))?;
                Ok(Value::Global(global))
            }
            _ => match self.peek_word() {
                Some("zeroinit") => {
                    self.read_word()?;
                    Ok(Value::Const(Constant::Zero(self.parse_type()?)))
                }
                Some("undef") => {
                    self.read_word()?;
                    Ok(Value::Const(Constant::Undef(self.parse_type()?)))
                }
                _ => Ok(Value::Const(self.parse_constant()?)),
            },
        }
    }

    fn parse_block_ref(&mut self, inst: InstId, slot: usize) -> PResult<BlockId> {
        let name = self.read_sigil_name('^')?;
        if let Some(block) = self.blocks.get(name) {
            return Ok(*block);
        }
        self.block_resolves.push(Resolve { name, inst, slot });
        Ok(BlockId(PENDING))
    }

    fn parse_operand_list(&mut self, func: FuncId, inst: InstId) -> PResult<Vec<Value>> {
        let mut operands = Vec::new();
        self.skip_whitespace();
        if matches!(self.peek(), Some('%' | '@' | '<' | '[')) || self.peek_is_scalar_type() {
            loop {
                operands.push(self.parse_value(func, inst, operands.len())?);
                if !self.try_read(',') {
                    break;
                }
            }
        }
        Ok(operands)
    }

    fn peek_is_scalar_type(&mut self) -> bool {
        match self.peek_word() {
            Some("zeroinit" | "undef") => true,
            Some(word) => ScalarType::from_name(word).is_some(),
            None => false,
        }
    }

    fn parse_instruction(&mut self, func: FuncId, block: BlockId) -> PResult<()> {
        self.skip_whitespace();
        let result = if self.peek() == Some('%') {
            let name = self.read_sigil_name('%')?;
            self.expect('=')?;
            Some(name)
        } else {
            None
        };

        let word = self.read_word()?;
        let (mnemonic, modifier) = match word.split_once('.') {
            Some((m, rest)) => (m, Some(rest)),
            None => (word, None),
        };
        let op = opcode_from_mnemonic(mnemonic, modifier)?;

        let id = InstId(self.module.func(func).insts.len() as u32);
        let mut inst = Inst::new(op, Type::Void, Vec::new());
        inst.name = result.map(str::to_string);

        match op {
            Opcode::Br => {
                inst.blocks.push(self.parse_block_ref(id, 0)?);
            }
            Opcode::CondBr => {
                inst.operands.push(self.parse_value(func, id, 0)?);
                self.expect(',')?;
                inst.blocks.push(self.parse_block_ref(id, 0)?);
                self.expect(',')?;
                inst.blocks.push(self.parse_block_ref(id, 1)?);
            }
            Opcode::Phi => loop {
                self.expect('[')?;
                let slot = inst.operands.len();
                inst.operands.push(self.parse_value(func, id, slot)?);
                self.expect(',')?;
                inst.blocks.push(self.parse_block_ref(id, slot)?);
                self.expect(']')?;
                if !self.try_read(',') {
                    break;
                }
            },
            Opcode::Call => {
                let callee = self.read_sigil_name('@')?;
                self.call_resolves.push(CallResolve { func, inst: id, callee });
                self.expect('(')?;
                if !self.try_read(')') {
                    loop {
                        let slot = inst.operands.len();
                        inst.operands.push(self.parse_value(func, id, slot)?);
                        if self.try_read(')') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                while let Some(attr) = self.peek_word() {
                    match attr {
                        "noinline" => inst.call_attrs.no_inline = true,
                        "alwaysinline" => inst.call_attrs.always_inline = true,
                        _ => break,
                    }
                    self.read_word()?;
                }
            }
            Opcode::Alloca => {
                let allocated = self.parse_type()?;
                inst.operands.push(Value::Const(Constant::Undef(allocated)));
                inst.ty = Type::Ptr(addrspace::PRIVATE);
            }
            _ => {
                inst.operands = self.parse_operand_list(func, id)?;
            }
        }

        if self.try_read(':') {
            inst.ty = self.parse_type()?;
        }
        if self.try_read_str("!loop") {
            inst.loop_md = Some(self.parse_loop_metadata()?);
        }

        check_shape(&inst)?;
        if result.is_some() == inst.ty.is_void() {
            return Err(format!(
                "'{mnemonic}' {} a result name and a non-void type together",
                if result.is_some() { "needs" } else { "cannot take" }
            ));
        }
        if let Some(name) = result {
            if self.values.insert(name, id).is_some() || self.args.contains_key(name) {
                return Err(format!("value '%{name}' defined twice"));
            }
        }
        self.module.func_mut(func).push_inst(block, inst);
        Ok(())
    }

    fn parse_loop_metadata(&mut self) -> PResult<LoopMetadata> {
        self.expect('(')?;
        let mut md = LoopMetadata::default();
        if self.try_read(')') {
            return Ok(md);
        }
        loop {
            let hint = match self.read_word()? {
                "unroll.enable" => LoopHint::UnrollEnable,
                "unroll.full" => LoopHint::UnrollFull,
                "unroll.disable" => LoopHint::UnrollDisable,
                "mustprogress" => LoopHint::MustProgress,
                "unroll.count" => {
                    self.expect('=')?;
                    LoopHint::UnrollCount(self.read_u64()? as u32)
                }
                other => return Err(format!("unknown loop hint '{other}'")),
            };
            md.hints.push(hint);
            if self.try_read(')') {
                return Ok(md);
            }
            self.expect(',')?;
        }
    }

    fn resolve_function_references(&mut self, func: FuncId) -> PResult<()> {
        let values = std::mem::take(&mut self.value_resolves);
        let blocks = std::mem::take(&mut self.block_resolves);
        let f = self.module.func_mut(func);
        for r in values {
            let id = *self.values.get(r.name).ok_or_else(|| format!("undefined value '%{}'", r.name))?;
            f.inst_mut(r.inst).operands[r.slot] = Value::Inst(id);
        }
        for r in blocks {
            let id = *self.blocks.get(r.name).ok_or_else(|| format!("undefined block '^{}'", r.name))?;
            f.inst_mut(r.inst).blocks[r.slot] = id;
        }
        for b in f.block_ids().collect::<Vec<_>>() {
            if f.terminator(b).is_none() {
                return Err(format!("block '{}' of '@{}' has no terminator", f.block(b).name, f.name));
            }
        }
        Ok(())
    }
}

fn parse_int(token: &str) -> PResult<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|e| format!("bad integer literal '{token}': {e}"))?;
    Ok(if negative { (magnitude as i64).wrapping_neg() } else { magnitude as i64 })
}

fn type_from_word(word: &str) -> Option<Type> {
    if word == "void" {
        return Some(Type::Void);
    }
    if let Some(space) = word.strip_prefix("ptr") {
        return if space.is_empty() { Some(Type::Ptr(0)) } else { space.parse().ok().map(Type::Ptr) };
    }
    ScalarType::from_name(word).map(Type::Scalar)
}

fn opcode_from_mnemonic(mnemonic: &str, modifier: Option<&str>) -> PResult<Opcode> {
    let op = match mnemonic {
        "add" => Opcode::Add,
        "sub" => Opcode::Sub,
        "mul" => Opcode::Mul,
        "mad" => Opcode::Mad,
        "and" => Opcode::And,
        "or" => Opcode::Or,
        "xor" => Opcode::Xor,
        "shl" => Opcode::Shl,
        "shr" => Opcode::Shr,
        "cmp" => {
            let pred = modifier
                .and_then(CmpPred::from_name)
                .ok_or_else(|| format!("cmp needs a predicate, found {modifier:?}"))?;
            return Ok(Opcode::Cmp(pred));
        }
        "select" => Opcode::Select,
        "dpas" => Opcode::Dpas,
        "lane_id" => Opcode::LaneId,
        "group_id" => Opcode::GroupId,
        "load" => Opcode::Load,
        "store" => Opcode::Store,
        "ptradd" => Opcode::PtrAdd,
        "alloca" => Opcode::Alloca,
        "call" => Opcode::Call,
        "phi" => Opcode::Phi,
        "br" => Opcode::Br,
        "condbr" => Opcode::CondBr,
        "ret" => Opcode::Ret,
        other => return Err(format!("unknown opcode '{other}'")),
    };
    if let Some(m) = modifier {
        return Err(format!("'{mnemonic}' takes no modifier, found '.{m}'"));
    }
    Ok(op)
}

fn check_shape(inst: &Inst) -> PResult<()> {
    let n = inst.operands.len();
    let expected = match inst.op {
        op if op.is_binary() => Some(2),
        Opcode::Cmp(_) | Opcode::Store | Opcode::PtrAdd => Some(2),
        Opcode::Mad | Opcode::Dpas | Opcode::Select => Some(3),
        Opcode::Load | Opcode::CondBr | Opcode::Alloca => Some(1),
        Opcode::LaneId | Opcode::GroupId | Opcode::Br => Some(0),
        Opcode::Ret => (n > 1).then_some(1),
        _ => None,
    };
    match expected {
        Some(e) if e != n => Err(format!("'{}' takes {e} operands, found {n}", inst.op.mnemonic())),
        _ => Ok(()),
    }
}
