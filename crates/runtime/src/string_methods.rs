//! Built-in methods on string receivers
//!
//! Strings have no method table; INVOKE on a string receiver resolves
//! against this fixed set. Every method validates its argument count and
//! types up front, then replaces receiver and arguments with its result.
//!
//! Indexing, lengths and slices are all in code-point units.

use yan_core::{Obj, ObjList, ObjRef, Value};

use crate::vm::{RuntimeError, Vm, resolve_index};

impl Vm {
    // Shared argument plumbing for the built-in method tables (lists use
    // these too).

    pub(crate) fn expect_argc(&mut self, expected: usize, got: usize) -> Result<(), RuntimeError> {
        if got == expected {
            Ok(())
        } else {
            Err(self.error(format!("需要 {expected} 个参数，但得到 {got}。")))
        }
    }

    pub(crate) fn expect_argc_range(
        &mut self,
        low: usize,
        high: usize,
        got: usize,
    ) -> Result<(), RuntimeError> {
        if (low..=high).contains(&got) {
            Ok(())
        } else {
            Err(self.error(format!("需要 {low} 到 {high} 个参数，但得到 {got}。")))
        }
    }

    /// The i-th argument (0-based); arguments sit above the receiver.
    pub(crate) fn arg(&self, arg_count: usize, index: usize) -> Value {
        self.peek(arg_count - 1 - index)
    }

    pub(crate) fn expect_string_arg(
        &mut self,
        arg_count: usize,
        index: usize,
        label: &str,
    ) -> Result<ObjRef, RuntimeError> {
        let value = self.arg(arg_count, index);
        match self.heap().as_string_ref(value) {
            Some(r) => Ok(r),
            None => {
                let actual = self.heap().type_label(value);
                Err(self.error(format!(
                    "参数 {}（{}）的类型必须是「字符串」，而不是「{}」。",
                    index + 1,
                    label,
                    actual
                )))
            }
        }
    }

    pub(crate) fn expect_number_arg(
        &mut self,
        arg_count: usize,
        index: usize,
        label: &str,
    ) -> Result<f64, RuntimeError> {
        let value = self.arg(arg_count, index);
        match value {
            Value::Number(n) => Ok(n),
            _ => {
                let actual = self.heap().type_label(value);
                Err(self.error(format!(
                    "参数 {}（{}）的类型必须是「数字」，而不是「{}」。",
                    index + 1,
                    label,
                    actual
                )))
            }
        }
    }

    /// Pop receiver and arguments, push the method result.
    pub(crate) fn finish_method(&mut self, arg_count: usize, result: Value) {
        let base = self.stack_len() - arg_count - 1;
        self.truncate_stack(base);
        self.push(result);
    }

    pub(crate) fn invoke_string_method(
        &mut self,
        receiver: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let name = self.heap().string(name).to_text();
        match name.as_str() {
            "长度" => {
                self.expect_argc(0, arg_count)?;
                let len = self.heap().string(receiver).len();
                self.finish_method(arg_count, Value::Number(len as f64));
                Ok(())
            }
            "指数" => {
                self.expect_argc(1, arg_count)?;
                let needle = self.expect_string_arg(arg_count, 0, "目标")?;
                let haystack = &self.heap().string(receiver).chars;
                let needle = &self.heap().string(needle).chars;
                let found = find_subsequence(haystack, needle, 0);
                let result = found.map_or(-1.0, |i| i as f64);
                self.finish_method(arg_count, Value::Number(result));
                Ok(())
            }
            "计数" => {
                self.expect_argc(1, arg_count)?;
                let needle = self.expect_string_arg(arg_count, 0, "目标")?;
                let haystack = &self.heap().string(receiver).chars;
                let needle = &self.heap().string(needle).chars;
                let mut count = 0.0;
                if !needle.is_empty() {
                    let mut from = 0;
                    while let Some(at) = find_subsequence(haystack, needle, from) {
                        count += 1.0;
                        from = at + needle.len();
                    }
                }
                self.finish_method(arg_count, Value::Number(count));
                Ok(())
            }
            "拆分" => {
                self.expect_argc(1, arg_count)?;
                let separators = self.expect_string_arg(arg_count, 0, "分隔")?;
                let chars = self.heap().string(receiver).chars.to_vec();
                let separators = self.heap().string(separators).chars.to_vec();
                self.split_into_list(arg_count, &chars, &separators)
            }
            "替换" => {
                self.expect_argc(2, arg_count)?;
                let old = self.expect_string_arg(arg_count, 0, "旧")?;
                let new = self.expect_string_arg(arg_count, 1, "新")?;
                let haystack = &self.heap().string(receiver).chars;
                let old = &self.heap().string(old).chars;
                let new = &self.heap().string(new).chars;
                let mut result: Vec<char> = Vec::with_capacity(haystack.len());
                if old.is_empty() {
                    result.extend_from_slice(haystack);
                } else {
                    let mut from = 0;
                    while let Some(at) = find_subsequence(haystack, old, from) {
                        result.extend_from_slice(&haystack[from..at]);
                        result.extend_from_slice(new);
                        from = at + old.len();
                    }
                    result.extend_from_slice(&haystack[from..]);
                }
                let interned = self.intern_chars(result);
                self.finish_method(arg_count, Value::Obj(interned));
                Ok(())
            }
            "修剪" => self.trim_method(receiver, arg_count, true, true),
            "修剪始" => self.trim_method(receiver, arg_count, true, false),
            "修剪端" => self.trim_method(receiver, arg_count, false, true),
            "大写" => {
                self.expect_argc(0, arg_count)?;
                let transformed: Vec<char> = self
                    .heap()
                    .string(receiver)
                    .chars
                    .iter()
                    .flat_map(|c| c.to_uppercase())
                    .collect();
                let interned = self.intern_chars(transformed);
                self.finish_method(arg_count, Value::Obj(interned));
                Ok(())
            }
            "小写" => {
                self.expect_argc(0, arg_count)?;
                let transformed: Vec<char> = self
                    .heap()
                    .string(receiver)
                    .chars
                    .iter()
                    .flat_map(|c| c.to_lowercase())
                    .collect();
                let interned = self.intern_chars(transformed);
                self.finish_method(arg_count, Value::Obj(interned));
                Ok(())
            }
            "子串" => {
                self.expect_argc(2, arg_count)?;
                let begin = self.expect_number_arg(arg_count, 0, "开头")?;
                let end = self.expect_number_arg(arg_count, 1, "结尾")?;
                let len = self.heap().string(receiver).len();
                let begin = match resolve_slice_bound(begin, len) {
                    Some(i) => i,
                    None => return Err(self.error("参数 1 不是有效索引。")),
                };
                let end = match resolve_slice_bound(end, len) {
                    Some(i) => i,
                    None => return Err(self.error("参数 2 不是有效索引。")),
                };
                if end < begin {
                    return Err(self.error("结束索引不能在开始索引之前。"));
                }
                let slice = self.heap().string(receiver).chars[begin..end].to_vec();
                let interned = self.intern_chars(slice);
                self.finish_method(arg_count, Value::Obj(interned));
                Ok(())
            }
            _ => Err(self.error(format!("未定义的属性「{name}」。"))),
        }
    }

    /// Split on a character class; empty pieces are dropped, matching the
    /// usual tokenizer behavior.
    fn split_into_list(
        &mut self,
        arg_count: usize,
        chars: &[char],
        separators: &[char],
    ) -> Result<(), RuntimeError> {
        let list = self.alloc(Obj::List(ObjList::default()));
        // Keep the list rooted while its pieces are interned.
        self.push(Value::Obj(list));
        let mut piece: Vec<char> = Vec::new();
        for &c in chars {
            let is_separator = if separators.is_empty() {
                false
            } else {
                separators.contains(&c)
            };
            if is_separator {
                if !piece.is_empty() {
                    let part = self.intern_chars(std::mem::take(&mut piece));
                    self.heap_mut().list_mut(list).items.push(Value::Obj(part));
                }
            } else {
                piece.push(c);
            }
        }
        if !piece.is_empty() {
            let part = self.intern_chars(piece);
            self.heap_mut().list_mut(list).items.push(Value::Obj(part));
        }
        self.pop();
        self.finish_method(arg_count, Value::Obj(list));
        Ok(())
    }

    /// Strip whitespace (no argument) or any character of the given set
    /// (one argument) from the chosen ends.
    fn trim_method(
        &mut self,
        receiver: ObjRef,
        arg_count: usize,
        start: bool,
        end: bool,
    ) -> Result<(), RuntimeError> {
        self.expect_argc_range(0, 1, arg_count)?;
        let set: Option<Vec<char>> = if arg_count == 1 {
            let set = self.expect_string_arg(arg_count, 0, "字符")?;
            Some(self.heap().string(set).chars.to_vec())
        } else {
            None
        };
        let strip = |c: char| match &set {
            Some(set) => set.contains(&c),
            None => c.is_whitespace(),
        };
        let chars = &self.heap().string(receiver).chars;
        let mut lo = 0;
        let mut hi = chars.len();
        if start {
            while lo < hi && strip(chars[lo]) {
                lo += 1;
            }
        }
        if end {
            while hi > lo && strip(chars[hi - 1]) {
                hi -= 1;
            }
        }
        let trimmed = chars[lo..hi].to_vec();
        let interned = self.intern_chars(trimmed);
        self.finish_method(arg_count, Value::Obj(interned));
        Ok(())
    }
}

/// First occurrence of `needle` in `haystack` at or after `from`.
fn find_subsequence(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return (from <= haystack.len()).then_some(from);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}

/// Slice bounds accept `0..=len` after negative mapping, unlike element
/// indexing which stops at `len - 1`.
fn resolve_slice_bound(raw: f64, len: usize) -> Option<usize> {
    if raw == len as f64 {
        return Some(len);
    }
    resolve_index(raw, len).or_else(|| (raw == -(len as f64)).then_some(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_subsequence() {
        let h: Vec<char> = "banana".chars().collect();
        let n: Vec<char> = "na".chars().collect();
        assert_eq!(find_subsequence(&h, &n, 0), Some(2));
        assert_eq!(find_subsequence(&h, &n, 3), Some(4));
        assert_eq!(find_subsequence(&h, &n, 5), None);
    }

    #[test]
    fn test_slice_bounds_are_half_open() {
        assert_eq!(resolve_slice_bound(0.0, 3), Some(0));
        assert_eq!(resolve_slice_bound(3.0, 3), Some(3));
        assert_eq!(resolve_slice_bound(-1.0, 3), Some(2));
        assert_eq!(resolve_slice_bound(-3.0, 3), Some(0));
        assert_eq!(resolve_slice_bound(4.0, 3), None);
        assert_eq!(resolve_slice_bound(0.0, 0), Some(0));
    }
}
