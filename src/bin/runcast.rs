use runcast::app::command_handlers;

fn run() -> Result<(), runcast::app::command_support::CliError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut stdout = std::io::stdout();
    let output = command_handlers::run_cli_with_output(args, &mut stdout)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(err.exit_code);
    }
}
