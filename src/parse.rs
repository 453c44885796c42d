/// Engine-to-provider UCI commands the provider reacts to
#[derive(PartialEq, Debug)]
pub enum UciOut {
    /// Sent after the 'uci' command
    UciOk,

    /// Sent after the 'isready' command
    ReadyOk,

    /// Closes a 'go' cycle
    BestMove,

    /// Periodic search output; only score-bearing lines are forwarded
    Info { has_score: bool },

    /// Option description, only interesting during the handshake
    Option { name: String, vars: Vec<String> },

    /// Anything else the engine prints
    Other,
}

/// Split an engine line into its command token and the remainder.
pub fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim_start()),
        None => (line, ""),
    }
}

/// Classify one line of engine output.
pub fn parse_uci(line: &str) -> UciOut {
    let (command, rest) = split_command(line);
    match command {
        "uciok" => UciOut::UciOk,
        "readyok" => UciOut::ReadyOk,
        "bestmove" => UciOut::BestMove,
        "info" => UciOut::Info {
            has_score: rest.contains("score"),
        },
        "option" => parse_option_line(rest),
        _ => UciOut::Other,
    }
}

/// Parse an option description for its name and 'var' values. Names may
/// contain spaces (i.e. `option name Clear Hash type button`).
fn parse_option_line(rest: &str) -> UciOut {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut name = Vec::new();
    let mut vars = Vec::new();
    let mut ix = 0;
    while ix < tokens.len() {
        match tokens[ix] {
            "name" => {
                ix += 1;
                while ix < tokens.len() && tokens[ix] != "type" {
                    name.push(tokens[ix]);
                    ix += 1;
                }
            }
            "var" => {
                if let Some(var) = tokens.get(ix + 1) {
                    vars.push((*var).to_string());
                }
                ix += 2;
            }
            _ => ix += 1,
        }
    }
    UciOut::Option {
        name: name.join(" "),
        vars,
    }
}
