use std::io;

use anyhow::{Result, bail};

use monkey::repl;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let stage = args.next().unwrap_or_else(|| "interpreter".to_string());
    if args.next().is_some() {
        bail!("Usage: monkey [interpreter|lexer|parser|vm]");
    }

    let mut input = io::stdin().lock();
    let mut output = io::stdout().lock();
    match stage.as_str() {
        "interpreter" => repl::start_interpreter(&mut input, &mut output),
        "lexer" => repl::start_lexer(&mut input, &mut output),
        "parser" => repl::start_parser(&mut input, &mut output),
        "vm" => repl::start_vm(&mut input, &mut output),
        _ => bail!("Unknown subcommand '{stage}'"),
    }
}
