use std::io::BufRead;
use std::thread;

use crossbeam_channel::Sender;
use playback::PlayerCommand;

/// One line typed on stdin during playback.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    Player(PlayerCommand),
    /// Playback rate multiplier; changes the tick period.
    Speed(f64),
    Next,
    Prev,
    Status,
    Quit,
}

pub const HELP: &str = "controls: p(ause/toggle) | play | s(top) | seek <frame> | speed <x> | n(ext) | b(ack) | r(econnect) | status | q(uit)";

pub fn parse_line(line: &str) -> Option<Input> {
    let mut words = line.split_whitespace();
    let head = words.next()?.to_ascii_lowercase();
    let arg = words.next();
    let input = match head.as_str() {
        "p" | "pause" | "toggle" => Input::Player(PlayerCommand::Toggle),
        "play" => Input::Player(PlayerCommand::Play),
        "s" | "stop" => Input::Player(PlayerCommand::Stop),
        "seek" => Input::Player(PlayerCommand::Seek(arg?.parse().ok()?)),
        "speed" => {
            let x: f64 = arg?.parse().ok()?;
            if !(x.is_finite() && x > 0.0) { return None; }
            Input::Speed(x)
        }
        "r" | "reconnect" => Input::Player(PlayerCommand::Reconnect),
        "n" | "next" => Input::Next,
        "b" | "prev" | "back" => Input::Prev,
        "status" => Input::Status,
        "q" | "quit" | "exit" => Input::Quit,
        _ => return None,
    };
    Some(input)
}

/// Forwards parsed stdin lines until stdin closes or the receiver is gone.
pub fn spawn_stdin_reader(tx: Sender<Input>) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_line(&line) {
                Some(input) => { if tx.send(input).is_err() { return; } }
                None if line.trim().is_empty() => {}
                None => eprintln!("{HELP}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("p"), Some(Input::Player(PlayerCommand::Toggle)));
        assert_eq!(parse_line("  SEEK 300 "), Some(Input::Player(PlayerCommand::Seek(300))));
        assert_eq!(parse_line("speed 2"), Some(Input::Speed(2.0)));
        assert_eq!(parse_line("q"), Some(Input::Quit));
        assert_eq!(parse_line("next"), Some(Input::Next));
    }

    #[test]
    fn test_parse_line_rejects_bad_input() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("seek"), None);
        assert_eq!(parse_line("seek -3"), None);
        assert_eq!(parse_line("speed 0"), None);
        assert_eq!(parse_line("speed nan"), None);
        assert_eq!(parse_line("dance"), None);
    }
}
