//! Chunk disassembler
//!
//! Renders bytecode for the CLI's disassembly mode and the VM's
//! per-instruction trace. Output format: offset, source line (or `|` when
//! unchanged), opcode name, operands.

use yan_core::{Chunk, Heap, Obj, OpCode, Value};

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render one instruction; returns the text and the next offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        text.push_str(&format!("unknown opcode {byte}"));
        return (text, offset + 1);
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => {
            let index = chunk.code[offset + 1];
            let value = chunk.constants[usize::from(index)];
            text.push_str(&format!(
                "{:<18} {:4} '{}'",
                op_name(op),
                index,
                heap.format_value(value)
            ));
            (text, offset + 2)
        }
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::BuildList => {
            let operand = chunk.code[offset + 1];
            text.push_str(&format!("{:<18} {operand:4}", op_name(op)));
            (text, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let operand =
                (u16::from(chunk.code[offset + 1]) << 8) | u16::from(chunk.code[offset + 2]);
            let target = if op == OpCode::Loop {
                offset + 3 - usize::from(operand)
            } else {
                offset + 3 + usize::from(operand)
            };
            text.push_str(&format!("{:<18} {offset:4} -> {target}", op_name(op)));
            (text, offset + 3)
        }
        OpCode::Invoke | OpCode::SuperInvoke => {
            let index = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            let value = chunk.constants[usize::from(index)];
            text.push_str(&format!(
                "{:<18} ({arg_count} args) {index:4} '{}'",
                op_name(op),
                heap.format_value(value)
            ));
            (text, offset + 3)
        }
        OpCode::Closure => {
            let index = chunk.code[offset + 1];
            let value = chunk.constants[usize::from(index)];
            text.push_str(&format!(
                "{:<18} {index:4} {}",
                op_name(op),
                heap.format_value(value)
            ));
            let mut next = offset + 2;
            if let Value::Obj(r) = value {
                if let Obj::Function(f) = heap.get(r) {
                    for _ in 0..f.upvalue_count {
                        let is_local = chunk.code[next];
                        let slot = chunk.code[next + 1];
                        let kind = if is_local != 0 { "local" } else { "upvalue" };
                        text.push_str(&format!("\n{:04}    |   {kind} {slot}", next));
                        next += 2;
                    }
                }
            }
            (text, next)
        }
        _ => {
            text.push_str(op_name(op));
            (text, offset + 1)
        }
    }
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "CONSTANT",
        OpCode::Nil => "NIL",
        OpCode::True => "TRUE",
        OpCode::False => "FALSE",
        OpCode::Pop => "POP",
        OpCode::GetLocal => "GET_LOCAL",
        OpCode::SetLocal => "SET_LOCAL",
        OpCode::GetGlobal => "GET_GLOBAL",
        OpCode::DefineGlobal => "DEFINE_GLOBAL",
        OpCode::SetGlobal => "SET_GLOBAL",
        OpCode::GetUpvalue => "GET_UPVALUE",
        OpCode::SetUpvalue => "SET_UPVALUE",
        OpCode::GetProperty => "GET_PROPERTY",
        OpCode::SetProperty => "SET_PROPERTY",
        OpCode::GetSuper => "GET_SUPER",
        OpCode::BuildList => "BUILD_LIST",
        OpCode::GetIndex => "GET_INDEX",
        OpCode::SetIndex => "SET_INDEX",
        OpCode::Equal => "EQUAL",
        OpCode::Greater => "GREATER",
        OpCode::Less => "LESS",
        OpCode::Add => "ADD",
        OpCode::Subtract => "SUBTRACT",
        OpCode::BitwiseNot => "BITWISE_NOT",
        OpCode::BitwiseOr => "BITWISE_OR",
        OpCode::BitwiseXor => "BITWISE_XOR",
        OpCode::BitwiseAnd => "BITWISE_AND",
        OpCode::ShiftLeft => "SHIFT_LEFT",
        OpCode::ShiftRight => "SHIFT_RIGHT",
        OpCode::Increment => "INCREMENT",
        OpCode::Decrement => "DECREMENT",
        OpCode::Multiply => "MULTIPLY",
        OpCode::Divide => "DIVIDE",
        OpCode::Modulo => "MODULO",
        OpCode::Not => "NOT",
        OpCode::Negate => "NEGATE",
        OpCode::Jump => "JUMP",
        OpCode::JumpIfFalse => "JUMP_IF_FALSE",
        OpCode::Loop => "LOOP",
        OpCode::Call => "CALL",
        OpCode::Invoke => "INVOKE",
        OpCode::SuperInvoke => "SUPER_INVOKE",
        OpCode::Closure => "CLOSURE",
        OpCode::CloseUpvalue => "CLOSE_UPVALUE",
        OpCode::Return => "RETURN",
        OpCode::Class => "CLASS",
        OpCode::Inherit => "INHERIT",
        OpCode::Method => "METHOD",
        OpCode::Dup => "DUP",
        OpCode::DoubleDup => "DOUBLE_DUP",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassembles_constants_and_simple_ops() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.5));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(index as u8, 1);
        chunk.write_op(OpCode::Return, 2);
        let text = disassemble_chunk(&heap, &chunk, "测试");
        assert!(text.contains("== 测试 =="));
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("'1.5'"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_jump_targets_are_absolute() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        let (text, next) = disassemble_instruction(&heap, &chunk, 0);
        assert_eq!(next, 3);
        assert!(text.contains("0 -> 5"), "got: {text}");
    }
}
