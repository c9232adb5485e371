//! End-to-end interpreter scenarios.
//!
//! Each test runs a complete script and inspects the surviving globals,
//! so the whole pipeline is exercised: scanner, compiler, dispatch loop,
//! method dispatch, and the collector underneath it all.

use yan_core::Value;
use yan_runtime::{InterpretResult, Vm, VmOptions};

fn run(source: &str) -> Vm {
    let mut vm = Vm::new();
    let result = vm.interpret(source);
    assert_eq!(result, InterpretResult::Ok, "error: {:?}", vm.take_error());
    vm
}

fn run_err(source: &str) -> String {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret(source), InterpretResult::RuntimeError);
    vm.take_error().expect("runtime error message")
}

fn number(vm: &Vm, name: &str) -> f64 {
    match vm.global(name) {
        Some(Value::Number(n)) => n,
        other => panic!("global {name} is not a number: {other:?}"),
    }
}

fn text(vm: &Vm, name: &str) -> String {
    let value = vm.global(name).unwrap_or_else(|| panic!("no global {name}"));
    let r = vm
        .heap()
        .as_string_ref(value)
        .unwrap_or_else(|| panic!("global {name} is not a string"));
    vm.heap().string(r).to_text()
}

fn numbers(vm: &Vm, name: &str) -> Vec<f64> {
    let value = vm.global(name).unwrap_or_else(|| panic!("no global {name}"));
    let r = vm
        .heap()
        .as_list_ref(value)
        .unwrap_or_else(|| panic!("global {name} is not a list"));
    vm.heap()
        .list(r)
        .items
        .iter()
        .map(|&v| match v {
            Value::Number(n) => n,
            other => panic!("list item is not a number: {other:?}"),
        })
        .collect()
}

// ----- end-to-end scenarios -----

#[test]
fn closure_counter_counts_one_two_three() {
    let vm = run(
        "功能 造(){
           变量 数 = 0；
           功能 增(){ 数 = 数 + 1；返回 数；}
           返回 增；
         }
         变量 增 = 造()；
         变量 一 = 增()；
         变量 二 = 增()；
         变量 三 = 增()；",
    );
    assert_eq!(number(&vm, "一"), 1.0);
    assert_eq!(number(&vm, "二"), 2.0);
    assert_eq!(number(&vm, "三"), 3.0);
}

#[test]
fn recursive_fibonacci() {
    let vm = run(
        "功能 斐(数){
           如果 (数 < 2) 返回 数；
           返回 斐(数 - 2) + 斐(数 - 1)；
         }
         变量 结 = 斐(25)；",
    );
    assert_eq!(number(&vm, "结"), 75025.0);
}

#[test]
fn class_with_init_and_super() {
    let vm = run(
        "类 甲 { 问(){ 返回 \"甲\"；} }
         类 乙 < 甲 { 问(){ 返回 超.问() + \"乙\"；} }
         变量 结 = 乙().问()；",
    );
    assert_eq!(text(&vm, "结"), "甲乙");
}

#[test]
fn initializer_receives_arguments() {
    let vm = run(
        "类 点 {
           初始化(横, 纵){ 这.横 = 横；这.纵 = 纵；}
           和(){ 返回 这.横 + 这.纵；}
         }
         变量 结 = 点(3, 4).和()；",
    );
    assert_eq!(number(&vm, "结"), 7.0);
}

#[test]
fn list_filter_reenters_the_vm() {
    let vm = run(
        "功能 偶(数){ 返回 数 % 2 == 0；}
         变量 结 = [1, 2, 3, 4].过滤(偶)；",
    );
    assert_eq!(numbers(&vm, "结"), vec![2.0, 4.0]);
}

#[test]
fn string_replace_all_occurrences() {
    let vm = run("变量 结 = \"banana\".替换(\"na\", \"XY\")；");
    assert_eq!(text(&vm, "结"), "baXYXY");
}

#[test]
fn gc_reclaims_transient_strings_and_intern_entries() {
    let mut vm = Vm::with_options(VmOptions {
        gc_threshold: 32 * 1024,
        ..VmOptions::default()
    });
    assert_eq!(
        vm.interpret("变量 计 = 0；变量 串 = \"甲\"；"),
        InterpretResult::Ok
    );
    vm.collect_garbage();
    let before = vm.heap().bytes_allocated();

    // Thousands of distinct transient strings (each iteration grows 串,
    // orphaning the previous one) plus transient lists.
    assert_eq!(
        vm.interpret(
            "而 (计 < 2500) {
               串 = 串 + \"乙\"；
               变量 临 = [计, 计, 计]；
               计 = 计 + 1；
             }"
        ),
        InterpretResult::Ok
    );
    assert_eq!(vm.interpret("串 = 空；"), InterpretResult::Ok);
    vm.collect_garbage();
    let after = vm.heap().bytes_allocated();

    assert!(
        after < before * 2 + 8 * 1024,
        "live bytes grew: before={before} after={after}"
    );
}

// ----- interning and equality -----

#[test]
fn concatenation_respects_interning_identity() {
    let vm = run("变量 结 = (\"甲乙\" + \"\") == \"甲乙\"；");
    assert_eq!(vm.global("结"), Some(Value::Bool(true)));
}

#[test]
fn nan_is_not_equal_to_itself() {
    let vm = run("变量 非数 = 0 / 0；变量 结 = 非数 == 非数；");
    assert_eq!(vm.global("结"), Some(Value::Bool(false)));
}

// ----- arithmetic -----

#[test]
fn modulo_and_bitwise_operators() {
    let vm = run(
        "变量 模 = 7 % 3；
         变量 负模 = -7 % 2；
         变量 与 = 5 & 3；
         变量 或 = 5 | 3；
         变量 异 = 5 ^ 3；
         变量 左 = 1 << 4；
         变量 右 = 32 >> 2；
         变量 反 = ~0；",
    );
    assert_eq!(number(&vm, "模"), 1.0);
    assert_eq!(number(&vm, "负模"), -1.0);
    assert_eq!(number(&vm, "与"), 1.0);
    assert_eq!(number(&vm, "或"), 7.0);
    assert_eq!(number(&vm, "异"), 6.0);
    assert_eq!(number(&vm, "左"), 16.0);
    assert_eq!(number(&vm, "右"), 8.0);
    assert_eq!(number(&vm, "反"), -1.0);
}

#[test]
fn increment_and_compound_assignment() {
    let vm = run(
        "变量 甲 = 1；
         变量 旧 = 甲++；
         甲 += 10；
         --甲；
         变量 新 = 甲；",
    );
    assert_eq!(number(&vm, "旧"), 1.0);
    assert_eq!(number(&vm, "新"), 11.0);
}

#[test]
fn for_loop_accumulates() {
    let vm = run(
        "变量 和 = 0；
         为 (变量 数 = 1；数 <= 10；数 = 数 + 1) { 和 += 数；}",
    );
    assert_eq!(number(&vm, "和"), 55.0);
}

#[test]
fn logical_operators_short_circuit() {
    let vm = run(
        "变量 甲 = 假 和 坏()；
         变量 乙 = 真 或 坏()；
         变量 丙 = 真 和 5；",
    );
    assert_eq!(vm.global("甲"), Some(Value::Bool(false)));
    assert_eq!(vm.global("乙"), Some(Value::Bool(true)));
    assert_eq!(number(&vm, "丙"), 5.0);
}

// ----- indexing -----

#[test]
fn indexing_with_negative_indices() {
    let vm = run(
        "变量 串 = \"甲乙丙\"；
         变量 尾 = 串[-1]；
         变量 头 = 串[0]；
         变量 表 = [10, 20, 30]；
         变量 中 = 表[1]；
         变量 末 = 表[-1]；
         表[-1] = 99；
         变量 改 = 表[2]；",
    );
    assert_eq!(text(&vm, "尾"), "丙");
    assert_eq!(text(&vm, "头"), "甲");
    assert_eq!(number(&vm, "中"), 20.0);
    assert_eq!(number(&vm, "末"), 30.0);
    assert_eq!(number(&vm, "改"), 99.0);
}

#[test]
fn subscript_errors() {
    assert!(run_err("变量 表 = [1]；表[真]；").contains("列表索引不是数字。"));
    assert!(run_err("变量 表 = [1]；表[5]；").contains("列表索引超出范围。"));
    assert!(run_err("变量 串 = \"甲\"；串[-2]；").contains("字符串索引超出范围。"));
    assert!(run_err("空[0]；").contains("无效类型索引到。"));
}

#[test]
fn strings_are_immutable_under_subscript_store() {
    let message = run_err("变量 串 = \"甲乙\"；串[0] = \"丙\"；");
    assert!(message.contains("字符串不可变"), "got: {message}");
}

// ----- calls and errors -----

#[test]
fn wrong_arity_reports_expected_and_got() {
    let message = run_err("功能 甲(乙){ 返回 乙；} 甲(1, 2)；");
    assert!(message.contains("需要 1 个参数，但得到 2。"), "got: {message}");
}

#[test]
fn unbounded_recursion_overflows_the_frame_limit() {
    let message = run_err("功能 递(){ 返回 递()；} 递()；");
    assert!(message.contains("堆栈溢出。"), "got: {message}");
}

#[test]
fn calling_a_non_callable_errors() {
    assert!(run_err("1()；").contains("只能调用功能和类。"));
}

#[test]
fn undefined_variable_and_property() {
    assert!(run_err("不存在；").contains("未定义的变量「不存在」。"));
    assert!(run_err("不存在 = 1；").contains("未定义的变量「不存在」。"));
    assert!(run_err("类 甲 {} 甲().没有()；").contains("未定义的属性「没有」。"));
}

#[test]
fn only_instances_strings_lists_have_methods() {
    assert!(run_err("1.长度()；").contains("只有实例、字符串和列表有方法。"));
}

#[test]
fn runtime_errors_carry_a_stack_trace() {
    let message = run_err(
        "功能 深(){ 返回 1 + 真；}
         功能 浅(){ 返回 深()；}
         浅()；",
    );
    assert!(message.contains("操作数必须是两个数字或两个字符串。"));
    assert!(message.contains("【行 1】在 深（）"), "got: {message}");
    assert!(message.contains("在 脚本"), "got: {message}");
}

// ----- classes -----

#[test]
fn fields_shadow_methods() {
    let vm = run(
        "类 盒 { 值(){ 返回 1；} }
         功能 二(){ 返回 2；}
         变量 盒子 = 盒()；
         盒子.值 = 二；
         变量 结 = 盒子.值()；",
    );
    assert_eq!(number(&vm, "结"), 2.0);
}

#[test]
fn bound_methods_capture_their_receiver() {
    let vm = run(
        "类 甲 { 名(){ 返回 这.号；} }
         变量 实 = 甲()；
         实.号 = 9；
         变量 方 = 实.名；
         变量 结 = 方()；",
    );
    assert_eq!(number(&vm, "结"), 9.0);
}

#[test]
fn unfused_super_access_binds_a_method() {
    let vm = run(
        "类 甲 { 问(){ 返回 \"甲\"；} }
         类 乙 < 甲 { 拿(){ 变量 方 = 超.问；返回 方()；} }
         变量 结 = 乙().拿()；",
    );
    assert_eq!(text(&vm, "结"), "甲");
}

#[test]
fn class_call_with_arguments_requires_initializer() {
    let message = run_err("类 甲 {} 甲(1)；");
    assert!(message.contains("需要 0 个参数，但得到 1。"), "got: {message}");
}

// ----- string methods -----

#[test]
fn string_length_counts_code_points() {
    let vm = run("变量 结 = \"汉字abc\".长度()；");
    assert_eq!(number(&vm, "结"), 5.0);
}

#[test]
fn string_index_of_and_count() {
    let vm = run(
        "变量 位 = \"banana\".指数(\"na\")；
         变量 无 = \"banana\".指数(\"zz\")；
         变量 计 = \"aaaa\".计数(\"aa\")；",
    );
    assert_eq!(number(&vm, "位"), 2.0);
    assert_eq!(number(&vm, "无"), -1.0);
    // Non-overlapping: the scan advances past each whole match.
    assert_eq!(number(&vm, "计"), 2.0);
}

#[test]
fn string_split_on_character_class() {
    let vm = run("变量 结 = \"甲,乙;丙\".拆分(\",;\")；");
    let value = vm.global("结").unwrap();
    let list = vm.heap().as_list_ref(value).unwrap();
    let items: Vec<String> = vm
        .heap()
        .list(list)
        .items
        .iter()
        .map(|&v| {
            let r = vm.heap().as_string_ref(v).unwrap();
            vm.heap().string(r).to_text()
        })
        .collect();
    assert_eq!(items, vec!["甲", "乙", "丙"]);
}

#[test]
fn string_split_round_trip_with_single_separator() {
    let vm = run(
        "变量 部 = \"前后\".拆分(\"-\")；
         变量 原 = \"前-后\".拆分(\"-\")；
         变量 结 = 原[0] + \"-\" + 原[1]；",
    );
    assert_eq!(text(&vm, "结"), "前-后");
}

#[test]
fn string_trim_family() {
    let vm = run(
        "变量 全 = \"  你好  \".修剪()；
         变量 始 = \"xx你好xx\".修剪始(\"x\")；
         变量 端 = \"xx你好xx\".修剪端(\"x\")；",
    );
    assert_eq!(text(&vm, "全"), "你好");
    assert_eq!(text(&vm, "始"), "你好xx");
    assert_eq!(text(&vm, "端"), "xx你好");
}

#[test]
fn string_case_transforms() {
    let vm = run("变量 大 = \"abc\".大写()；变量 小 = \"ABC\".小写()；");
    assert_eq!(text(&vm, "大"), "ABC");
    assert_eq!(text(&vm, "小"), "abc");
}

#[test]
fn substring_half_open_with_negative_indices() {
    let vm = run(
        "变量 中 = \"甲乙丙丁\".子串(1, 3)；
         变量 全 = \"甲乙丙丁\".子串(0, 4)；
         变量 空串 = \"甲乙丙丁\".子串(2, 2)；
         变量 负 = \"甲乙丙丁\".子串(-3, -1)；",
    );
    assert_eq!(text(&vm, "中"), "乙丙");
    assert_eq!(text(&vm, "全"), "甲乙丙丁");
    assert_eq!(text(&vm, "空串"), "");
    assert_eq!(text(&vm, "负"), "乙丙");
}

#[test]
fn substring_rejects_reversed_bounds() {
    let message = run_err("\"甲乙\".子串(1, 0)；");
    assert!(message.contains("结束索引不能在开始索引之前。"), "got: {message}");
}

#[test]
fn string_method_argument_types_are_checked() {
    let message = run_err("\"甲\".指数(1)；");
    assert!(message.contains("类型必须是「字符串」"), "got: {message}");
    let message = run_err("\"甲\".长度(1)；");
    assert!(message.contains("需要 0 个参数，但得到 1。"), "got: {message}");
}

// ----- list methods -----

#[test]
fn list_push_pop_round_trip() {
    let vm = run(
        "变量 表 = [1, 2]；
         表.推(3)；
         变量 长 = 表.长度()；
         表.弹()；
         变量 后 = 表.长度()；",
    );
    assert_eq!(number(&vm, "长"), 3.0);
    assert_eq!(number(&vm, "后"), 2.0);
    assert_eq!(numbers(&vm, "表"), vec![1.0, 2.0]);
}

#[test]
fn list_insert_then_remove_restores_the_list() {
    let vm = run(
        "变量 表 = [1, 2, 3]；
         表.插(1, 9)；
         变量 长 = 表.长度()；
         表.删(1)；",
    );
    assert_eq!(number(&vm, "长"), 4.0);
    assert_eq!(numbers(&vm, "表"), vec![1.0, 2.0, 3.0]);
}

#[test]
fn popping_an_empty_list_errors() {
    assert!(run_err("[].弹()；").contains("无法从空列表中弹出。"));
}

#[test]
fn list_sort_default_and_with_comparator() {
    let vm = run(
        "变量 甲 = [3, 1, 2].排序()；
         功能 降(左, 右){ 返回 右 - 左；}
         变量 乙 = [3, 1, 2].排序(降)；",
    );
    assert_eq!(numbers(&vm, "甲"), vec![1.0, 2.0, 3.0]);
    assert_eq!(numbers(&vm, "乙"), vec![3.0, 2.0, 1.0]);
}

#[test]
fn list_filter_requires_unary_predicate() {
    let message = run_err(
        "功能 二(甲, 乙){ 返回 真；}
         [1].过滤(二)；",
    );
    assert!(message.contains("输入功能需要 1 个参数"), "got: {message}");
}

// ----- the core module -----

#[test]
fn math_natives() {
    let vm = run(
        "变量 根 = 数学.平方根(9)；
         变量 大 = 数学.最大(3, 7)；
         变量 幂 = 数学.幂(2, 10)；
         变量 圆 = 数学.圆周率；",
    );
    assert_eq!(number(&vm, "根"), 3.0);
    assert_eq!(number(&vm, "大"), 7.0);
    assert_eq!(number(&vm, "幂"), 1024.0);
    assert!((number(&vm, "圆") - std::f64::consts::PI).abs() < 1e-12);
}

#[test]
fn clock_native_returns_a_positive_number() {
    let vm = run("变量 时 = 系统.时钟()；");
    assert!(number(&vm, "时") > 0.0);
}

#[test]
fn native_arity_is_validated() {
    let message = run_err("数学.平方根(1, 2)；");
    assert!(message.contains("需要 1 个参数，但得到 2。"), "got: {message}");
}

#[test]
fn native_argument_types_are_validated() {
    let message = run_err("数学.平方根(\"九\")；");
    assert!(message.contains("类型必须是「数字」"), "got: {message}");
}

#[test]
fn static_instances_refuse_field_stores() {
    let message = run_err("数学.圆周率 = 3；");
    assert!(message.contains("不能修改常量属性。"), "got: {message}");
}
