//! The built-in core module
//!
//! Two static singleton instances are installed as globals: 系统 (clock
//! and console I/O) and 数学 (float helpers). Their classes carry native
//! methods; the instances are static, so user code cannot reassign
//! their fields.
//!
//! Natives run with the convention of [`yan_core::NativeFn`]: validated
//! arguments in, `Result` out; an `Err` becomes a runtime error.

use std::io::{BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use yan_core::{Heap, Obj, ObjClass, ObjInstance, Table, Value};

use crate::vm::Vm;

/// Install the core module into a fresh VM. Runs before any user code,
/// so plain heap allocation (no collection trigger) is safe here.
pub(crate) fn install(vm: &mut Vm) {
    let system_class = make_class(vm, "系统类");
    vm.define_native(system_class, "时钟", Some(0), native_clock);
    vm.define_native(system_class, "打印", Some(1), native_print);
    vm.define_native(system_class, "写", Some(1), native_write);
    vm.define_native(system_class, "读行", Some(0), native_read_line);
    let system = make_static_instance(vm, system_class);
    vm.define_native_instance("系统", system);

    let math_class = make_class(vm, "数学类");
    vm.define_native(math_class, "绝对值", Some(1), native_abs);
    vm.define_native(math_class, "平方根", Some(1), native_sqrt);
    vm.define_native(math_class, "幂", Some(2), native_pow);
    vm.define_native(math_class, "下取整", Some(1), native_floor);
    vm.define_native(math_class, "上取整", Some(1), native_ceil);
    vm.define_native(math_class, "四舍五入", Some(1), native_round);
    vm.define_native(math_class, "最大", Some(2), native_max);
    vm.define_native(math_class, "最小", Some(2), native_min);
    let math = make_static_instance(vm, math_class);
    vm.define_property(math, "圆周率", Value::Number(std::f64::consts::PI));
    vm.define_native_instance("数学", math);
}

fn make_class(vm: &mut Vm, name: &str) -> yan_core::ObjRef {
    let name = vm.heap_mut().intern(name);
    vm.heap_mut().alloc(Obj::Class(ObjClass {
        name,
        methods: Table::new(),
    }))
}

fn make_static_instance(vm: &mut Vm, class: yan_core::ObjRef) -> yan_core::ObjRef {
    vm.heap_mut().alloc(Obj::Instance(ObjInstance {
        class,
        fields: Table::new(),
        is_static: true,
    }))
}

fn number_arg(heap: &Heap, args: &[Value], index: usize, label: &str) -> Result<f64, String> {
    match args[index] {
        Value::Number(n) => Ok(n),
        other => Err(format!(
            "参数 {}（{}）的类型必须是「数字」，而不是「{}」。",
            index + 1,
            label,
            heap.type_label(other)
        )),
    }
}

/// Seconds since the Unix epoch, as a number.
fn native_clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(seconds))
}

fn native_print(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    println!("{}", heap.format_value(args[0]));
    Ok(Value::Nil)
}

fn native_write(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    print!("{}", heap.format_value(args[0]));
    std::io::stdout().flush().ok();
    Ok(Value::Nil)
}

fn native_read_line(heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim_end_matches(['\n', '\r']);
            Ok(Value::Obj(heap.intern(trimmed)))
        }
        Err(e) => Err(format!("读取输入失败：{e}。")),
    }
}

fn native_abs(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(number_arg(heap, args, 0, "数")?.abs()))
}

fn native_sqrt(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(number_arg(heap, args, 0, "数")?.sqrt()))
}

fn native_pow(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let base = number_arg(heap, args, 0, "底")?;
    let exponent = number_arg(heap, args, 1, "指")?;
    Ok(Value::Number(base.powf(exponent)))
}

fn native_floor(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(number_arg(heap, args, 0, "数")?.floor()))
}

fn native_ceil(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(number_arg(heap, args, 0, "数")?.ceil()))
}

fn native_round(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(number_arg(heap, args, 0, "数")?.round()))
}

fn native_max(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let a = number_arg(heap, args, 0, "甲")?;
    let b = number_arg(heap, args, 1, "乙")?;
    Ok(Value::Number(a.max(b)))
}

fn native_min(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let a = number_arg(heap, args, 0, "甲")?;
    let b = number_arg(heap, args, 1, "乙")?;
    Ok(Value::Number(a.min(b)))
}
