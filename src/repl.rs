// File: src/repl.rs
//
// Interactive REPL: read a line, compile + interpret it against one
// persistent `Vm`, loop; `quit()` or EOF exits (spec.md §6). Keeps the
// teacher's `rustyline` + `colored` combination and its brace-balance
// multi-line continuation detection (`is_input_complete`) -- this
// language's grammar has no `#` line comments or backslash string escapes,
// so those two teacher-specific cases are dropped from the balance check.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{InterpretError, Vm};

pub struct Repl {
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!("{}", "║                 Lumen REPL                            ║".bright_cyan());
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!("  {} leave braces/parens unclosed to continue on the next line.", "Tip:".bright_magenta());
        println!("  {} or Ctrl+D to exit.", "quit()".bright_yellow());
        println!();
    }

    pub fn run(&mut self, vm: &mut Vm) {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "lumen> ".bright_green().to_string()
            } else {
                "  ...> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && is_quit_command(&line) {
                        println!("{}", "Goodbye!".bright_cyan());
                        break;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(vm, &buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }
    }

    fn eval_input(&mut self, vm: &mut Vm, input: &str) {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return;
        }
        if let Err(err) = vm.interpret(input) {
            self.print_error(&err);
        }
    }

    fn print_error(&self, err: &InterpretError) {
        match err {
            InterpretError::Compile(errors) => {
                for e in errors {
                    println!("{}", e.to_string().red());
                }
            }
            InterpretError::Runtime(e) => {
                print!("{e}");
            }
        }
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to initialize line editor")
    }
}

/// Recognizes the REPL's one pseudo-command. `quit` is not a VM native
/// (spec.md §4.H's native list is `clock`/`error`/`get`/`delete`/`is`
/// only); the CLI-level description in spec.md §6 treats `quit()` as a
/// REPL-level exit signal, so it's matched here before compiling.
fn is_quit_command(line: &str) -> bool {
    matches!(line.trim(), "quit()" | "quit();")
}

/// True if every brace/bracket/paren in `input` is balanced outside a
/// string literal. Strings in this language have no escape sequences
/// (scanner.rs), so a bare `"` always toggles string mode.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace = 0i32;
    let mut bracket = 0i32;
    let mut paren = 0i32;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut chars = trimmed.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = !in_string,
            '/' if !in_string && chars.peek() == Some(&'/') => in_line_comment = true,
            '{' if !in_string => brace += 1,
            '}' if !in_string => brace -= 1,
            '[' if !in_string => bracket += 1,
            ']' if !in_string => bracket -= 1,
            '(' if !in_string => paren += 1,
            ')' if !in_string => paren -= 1,
            _ => {}
        }
    }

    !in_string && brace <= 0 && bracket <= 0 && paren <= 0
}

pub fn run(vm: &mut Vm) {
    let mut repl = Repl::default();
    repl.run(vm);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclosed_brace_is_incomplete() {
        assert!(!is_input_complete("fun f() {"));
    }

    #[test]
    fn closed_block_is_complete() {
        assert!(is_input_complete("fun f() { return 1; }"));
    }

    #[test]
    fn brace_inside_a_string_does_not_count() {
        assert!(is_input_complete("print \"{ not a brace\";"));
    }

    #[test]
    fn recognizes_quit_command() {
        assert!(is_quit_command("quit()"));
        assert!(is_quit_command("  quit();  "));
        assert!(!is_quit_command("quitter()"));
    }
}
