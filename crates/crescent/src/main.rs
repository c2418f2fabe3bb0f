use std::io::Read;

use crescent_vm::api::MULTRET;
use crescent_vm::baselib;
use crescent_vm::error::Status;
use crescent_vm::vm::State;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut exec_statements: Vec<String> = Vec::new();
    let mut interactive = false;
    let mut show_version = false;
    let mut script_args: Vec<String> = Vec::new();
    let mut saw_dashdash = false;

    let mut i = 1;
    while i < args.len() {
        if saw_dashdash {
            script_args.push(args[i].clone());
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--" => {
                saw_dashdash = true;
                i += 1;
            }
            "-v" => {
                show_version = true;
                i += 1;
            }
            "-i" => {
                interactive = true;
                i += 1;
            }
            "-e" => {
                if i + 1 >= args.len() {
                    eprintln!("crescent: '-e' needs argument");
                    std::process::exit(1);
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            _ => {
                if args[i].starts_with('-') && args[i] != "-" {
                    if args[i].starts_with("-e") && args[i].len() > 2 {
                        exec_statements.push(args[i][2..].to_string());
                        i += 1;
                    } else {
                        eprintln!("crescent: unrecognized option '{}'", args[i]);
                        std::process::exit(1);
                    }
                } else {
                    script_file = Some(args[i].clone());
                    script_args = args[i + 1..].to_vec();
                    break;
                }
            }
        }
    }

    if show_version {
        println!("Crescent 0.1.0 -- Lua 5.3");
    }

    let stdin_is_tty = atty_check();
    let go_interactive = interactive
        || (script_file.is_none() && exec_statements.is_empty() && stdin_is_tty && !show_version);

    if !exec_statements.is_empty() || script_file.is_some() {
        let mut st = create_state(&script_file, &script_args);

        for stat in &exec_statements {
            if let Err(msg) = run_chunk(&mut st, stat.as_bytes(), "=(command line)") {
                eprintln!("crescent: {msg}");
                std::process::exit(1);
            }
        }

        if let Some(ref path) = script_file {
            let (source, name) = if path == "-" {
                let mut buf = Vec::new();
                if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                    eprintln!("crescent: cannot read stdin: {e}");
                    std::process::exit(1);
                }
                (buf, "=stdin".to_string())
            } else {
                match std::fs::read(path) {
                    Ok(data) => (data, format!("@{path}")),
                    Err(e) => {
                        eprintln!("crescent: cannot open {path}: {e}");
                        std::process::exit(1);
                    }
                }
            };
            let source = strip_shebang(&source);
            if let Err(msg) = run_chunk(&mut st, source, &name) {
                eprintln!("crescent: {msg}");
                std::process::exit(1);
            }
        }

        if interactive {
            run_repl(st);
        }
    } else if !stdin_is_tty && !show_version {
        let mut st = create_state(&None, &[]);
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("crescent: cannot read stdin: {e}");
            std::process::exit(1);
        }
        if let Err(msg) = run_chunk(&mut st, strip_shebang(&buf), "=stdin") {
            eprintln!("crescent: {msg}");
            std::process::exit(1);
        }
    } else if go_interactive {
        if !show_version {
            println!("Crescent 0.1.0 -- Lua 5.3");
        }
        run_repl(create_state(&None, &[]));
    }
}

fn create_state(script_file: &Option<String>, script_args: &[String]) -> State {
    let mut st = State::new();
    baselib::open_base(&mut st).expect("base library");

    // The conventional `arg` table: arg[0] is the script, arg[1..] its
    // arguments, arg[-1] the interpreter.
    st.create_table(script_args.len(), 2).expect("arg table");
    st.push_string("crescent").expect("push");
    st.raw_set_i(-2, -1).expect("arg[-1]");
    if let Some(path) = script_file {
        st.push_string(path).expect("push");
        st.raw_set_i(-2, 0).expect("arg[0]");
    }
    for (i, a) in script_args.iter().enumerate() {
        st.push_string(a).expect("push");
        st.raw_set_i(-2, i as i64 + 1).expect("arg[i]");
    }
    st.set_global("arg").expect("set arg");
    st
}

/// Load and run a chunk, reporting errors as strings.
fn run_chunk(st: &mut State, chunk: &[u8], name: &str) -> Result<(), String> {
    if st.load_chunk(chunk, name) != Status::Ok {
        let msg = st.to_string_value(-1).unwrap_or_else(|| "?".to_string());
        st.pop(1);
        return Err(msg);
    }
    if st.protected_call(0, 0, None) != Status::Ok {
        let msg = st.to_string_value(-1).unwrap_or_else(|| "?".to_string());
        st.pop(1);
        return Err(msg);
    }
    Ok(())
}

fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos..],
            None => b"",
        }
    } else {
        source
    }
}

fn run_repl(mut st: State) {
    let config = rustyline::config::Config::builder()
        .auto_add_history(true)
        .build();
    let mut rl = match rustyline::DefaultEditor::with_config(config) {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("crescent: cannot initialize line editor: {e}");
            return;
        }
    };

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                // Expression first, statement second, continuation on
                // an unfinished chunk.
                let as_expr = format!("return {line}");
                if try_line(&mut st, &as_expr) {
                    continue;
                }
                let mut full = line;
                loop {
                    match eval_line(&mut st, &full) {
                        Ok(()) => break,
                        Err(msg) if msg.contains("<eof>") => match rl.readline(">> ") {
                            Ok(cont) => {
                                full.push('\n');
                                full.push_str(&cont);
                            }
                            Err(_) => {
                                eprintln!("{msg}");
                                break;
                            }
                        },
                        Err(msg) => {
                            eprintln!("{msg}");
                            break;
                        }
                    }
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("crescent: readline error: {e}");
                break;
            }
        }
    }
}

/// Run a line, printing its results; false when it does not parse.
fn try_line(st: &mut State, source: &str) -> bool {
    if st.load_chunk(source.as_bytes(), "=stdin") != Status::Ok {
        st.pop(1);
        return false;
    }
    run_loaded_and_print(st);
    true
}

fn eval_line(st: &mut State, source: &str) -> Result<(), String> {
    if st.load_chunk(source.as_bytes(), "=stdin") != Status::Ok {
        let msg = st.to_string_value(-1).unwrap_or_default();
        st.pop(1);
        return Err(msg);
    }
    run_loaded_and_print(st);
    Ok(())
}

/// Call the loaded chunk at the top and print whatever it returns.
fn run_loaded_and_print(st: &mut State) {
    let before = st.get_top() - 1;
    if st.protected_call(0, MULTRET, None) != Status::Ok {
        let msg = st.to_string_value(-1).unwrap_or_default();
        st.pop(1);
        eprintln!("{msg}");
        return;
    }
    let n_results = st.get_top() - before;
    if n_results > 0 {
        let mut parts = Vec::with_capacity(n_results);
        for i in 0..n_results {
            let idx = (before + 1 + i) as isize;
            let v = st.value_at(idx);
            match crescent_vm::baselib::tostring_value(st, v) {
                Ok(id) => parts.push(st.strings.display(id).into_owned()),
                Err(e) => parts.push(format!("<error: {e}>")),
            }
        }
        println!("{}", parts.join("\t"));
    }
    st.pop(n_results);
}

/// Is stdin a terminal?
fn atty_check() -> bool {
    #[cfg(unix)]
    {
        extern "C" {
            fn isatty(fd: i32) -> i32;
        }
        unsafe { isatty(0) != 0 }
    }
    #[cfg(not(unix))]
    {
        true
    }
}
