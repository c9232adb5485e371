//! Interactive REPL
//!
//! One `interpret` call per line against a single long-lived VM, so
//! globals, classes, and functions persist across entries. Errors are
//! reported and the loop continues. History persists under the user's
//! data directory.

use std::path::PathBuf;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use yan_runtime::Vm;

const PROMPT: &str = "言> ";

fn history_path() -> Option<PathBuf> {
    let mut path = dirs::data_dir()?;
    path.push("yan");
    std::fs::create_dir_all(&path).ok()?;
    path.push("history.txt");
    Some(path)
}

pub fn run(vm: &mut Vm) -> Result<(), String> {
    let mut editor = DefaultEditor::new().map_err(|e| format!("无法启动行编辑器：{e}"))?;
    let history = history_path();
    if let Some(path) = &history {
        // First run has no history yet.
        let _ = editor.load_history(path);
    }

    println!("言 {}（输入 Ctrl-D 退出）", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                // Result is irrelevant here: errors were already printed
                // and the session carries on.
                let _ = vm.interpret(&line);
                vm.take_error();
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(format!("读取输入失败：{e}")),
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
    Ok(())
}
