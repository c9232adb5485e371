//! Built-in methods on list receivers
//!
//! 过滤 and 排序 take user closures and re-enter the VM through
//! [`Vm::run_closure`]; both keep every intermediate value reachable from
//! the stack or the receiver so a collection triggered mid-callback
//! cannot free it.

use yan_core::{Obj, ObjList, ObjRef, Value};

use crate::vm::{RuntimeError, Vm, resolve_index};

impl Vm {
    pub(crate) fn invoke_list_method(
        &mut self,
        receiver: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let name = self.heap().string(name).to_text();
        match name.as_str() {
            "推" => {
                self.expect_argc(1, arg_count)?;
                let item = self.arg(arg_count, 0);
                self.heap_mut().list_mut(receiver).items.push(item);
                self.finish_method(arg_count, Value::Nil);
                Ok(())
            }
            "弹" => {
                self.expect_argc(0, arg_count)?;
                if self.heap().list(receiver).items.is_empty() {
                    return Err(self.error("无法从空列表中弹出。"));
                }
                self.heap_mut().list_mut(receiver).items.pop();
                self.finish_method(arg_count, Value::Nil);
                Ok(())
            }
            "插" => {
                self.expect_argc(2, arg_count)?;
                let raw = self.expect_number_arg(arg_count, 0, "索引")?;
                let item = self.arg(arg_count, 1);
                let len = self.heap().list(receiver).items.len();
                let Some(index) = resolve_index(raw, len) else {
                    return Err(self.error("参数 1 不是有效索引。"));
                };
                self.heap_mut().list_mut(receiver).items.insert(index, item);
                self.finish_method(arg_count, Value::Nil);
                Ok(())
            }
            "删" => {
                self.expect_argc(1, arg_count)?;
                let raw = self.expect_number_arg(arg_count, 0, "索引")?;
                let len = self.heap().list(receiver).items.len();
                let Some(index) = resolve_index(raw, len) else {
                    return Err(self.error("参数 1 不是有效索引。"));
                };
                self.heap_mut().list_mut(receiver).items.remove(index);
                self.finish_method(arg_count, Value::Nil);
                Ok(())
            }
            "长度" => {
                self.expect_argc(0, arg_count)?;
                let len = self.heap().list(receiver).items.len();
                self.finish_method(arg_count, Value::Number(len as f64));
                Ok(())
            }
            "过滤" => {
                self.expect_argc(1, arg_count)?;
                let predicate = self.expect_closure_arg(arg_count, 0, "测试")?;
                self.expect_callback_arity(predicate, 1)?;
                self.filter_list(receiver, predicate, arg_count)
            }
            "排序" => {
                self.expect_argc_range(0, 1, arg_count)?;
                let comparator = if arg_count == 1 {
                    let c = self.expect_closure_arg(arg_count, 0, "比较")?;
                    self.expect_callback_arity(c, 2)?;
                    Some(c)
                } else {
                    None
                };
                self.sort_list(receiver, comparator, arg_count)
            }
            _ => Err(self.error(format!("未定义的属性「{name}」。"))),
        }
    }

    fn expect_closure_arg(
        &mut self,
        arg_count: usize,
        index: usize,
        label: &str,
    ) -> Result<ObjRef, RuntimeError> {
        let value = self.arg(arg_count, index);
        match self.heap().as_closure_ref(value) {
            Some(r) => Ok(r),
            None => {
                let actual = self.heap().type_label(value);
                Err(self.error(format!(
                    "参数 {}（{}）的类型必须是「功能」，而不是「{}」。",
                    index + 1,
                    label,
                    actual
                )))
            }
        }
    }

    fn expect_callback_arity(
        &mut self,
        closure: ObjRef,
        expected: usize,
    ) -> Result<(), RuntimeError> {
        let function = self.heap().closure(closure).function;
        let arity = usize::from(self.heap().function(function).arity);
        if arity == expected {
            Ok(())
        } else {
            Err(self.error(format!("输入功能需要 {expected} 个参数，但得到 {arity}。")))
        }
    }

    fn filter_list(
        &mut self,
        receiver: ObjRef,
        predicate: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let filtered = self.alloc(Obj::List(ObjList::default()));
        // Rooted while callbacks run and allocate.
        self.push(Value::Obj(filtered));
        let mut index = 0;
        while index < self.heap().list(receiver).items.len() {
            let item = self.heap().list(receiver).items[index];
            let keep = self.run_closure(predicate, &[item])?;
            if !keep.is_falsey() {
                self.heap_mut().list_mut(filtered).items.push(item);
            }
            index += 1;
        }
        self.pop();
        self.finish_method(arg_count, Value::Obj(filtered));
        Ok(())
    }

    /// In-place insertion sort. Items stay in the receiver until the
    /// write-back, so everything remains rooted across comparator calls.
    fn sort_list(
        &mut self,
        receiver: ObjRef,
        comparator: Option<ObjRef>,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let mut items = self.heap().list(receiver).items.clone();
        for i in 1..items.len() {
            let mut j = i;
            while j > 0 {
                let first_wins = self.in_order(comparator, items[j], items[j - 1])?;
                if !first_wins {
                    break;
                }
                items.swap(j - 1, j);
                j -= 1;
            }
        }
        self.heap_mut().list_mut(receiver).items = items;
        self.finish_method(arg_count, Value::Obj(receiver));
        Ok(())
    }

    /// True when `a` must come before `b`.
    fn in_order(
        &mut self,
        comparator: Option<ObjRef>,
        a: Value,
        b: Value,
    ) -> Result<bool, RuntimeError> {
        if let Some(comparator) = comparator {
            let ordering = self.run_closure(comparator, &[a, b])?;
            let Value::Number(n) = ordering else {
                return Err(self.error("比较功能必须返回数字。"));
            };
            return Ok(n < 0.0);
        }
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::Obj(a), Value::Obj(b)) => {
                match (self.heap().as_string_ref(Value::Obj(a)), self.heap().as_string_ref(Value::Obj(b))) {
                    (Some(a), Some(b)) => {
                        Ok(self.heap().string(a).chars < self.heap().string(b).chars)
                    }
                    _ => Err(self.error("排序需要全是数字或全是字符串的元素。")),
                }
            }
            _ => Err(self.error("排序需要全是数字或全是字符串的元素。")),
        }
    }
}
