//! Startup instruction prompt

use std::io::{BufRead, Write};

pub const PROMPT: &str = "Type or paste some instructions below or leave it blank for default. \
(press 'Enter' with an empty line to move ahead)";

/// Read lines until an empty line or end of input.
///
/// Each line keeps a trailing newline; an immediately empty line yields an
/// empty string, meaning "use the remote defaults".
pub fn read_instructions<R: BufRead>(input: R) -> std::io::Result<String> {
    let mut instructions = String::new();
    for line in input.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        instructions.push_str(line);
        instructions.push('\n');
    }
    Ok(instructions)
}

/// Print the prompt and read instructions from stdin
pub fn prompt_instructions() -> std::io::Result<String> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", PROMPT)?;
    stdout.flush()?;
    read_instructions(std::io::stdin().lock())
}
