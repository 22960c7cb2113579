use std::fmt;

pub const HELP: &str = "\
Commands:
  show                     - List audio output devices
  set <index>              - Set loopback (source) device
  add <index>              - Add output (target) device
  remove <index>           - Remove output device
  clear                    - Remove all output devices
  volume <index> <0-100>   - Set volume for specific output device
  global <0-100>           - Set global volume multiplier
  start                    - Start audio relay
  stop                     - Stop audio relay
  status [json]            - Show current status
  refresh                  - Re-scan audio output devices
  help                     - Show this list
  exit                     - Exit program";

/// One line of shell input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Show,
    SetSource(usize),
    AddTarget(usize),
    Remove(usize),
    Clear,
    /// Per-device volume in percent.
    Volume { index: usize, percent: f32 },
    /// Global volume in percent.
    Global(f32),
    Start,
    Stop,
    Status { json: bool },
    Refresh,
    Help,
    Exit,
    /// Blank line.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Unknown,
    Usage(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown command."),
            Self::Usage(usage) => write!(f, "Usage: {}", usage),
        }
    }
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(Self::Empty);
        };
        let args: Vec<&str> = words.collect();

        let command = match name.to_ascii_lowercase().as_str() {
            "show" => Self::Show,
            "set" => Self::SetSource(index_arg(&args, "set <index>")?),
            "add" => Self::AddTarget(index_arg(&args, "add <index>")?),
            "remove" => Self::Remove(index_arg(&args, "remove <index>")?),
            "clear" => Self::Clear,
            "volume" => {
                const USAGE: &str = "volume <index> <0-100>";
                match args.as_slice() {
                    [index, percent] => Self::Volume {
                        index: index.parse().map_err(|_| ParseError::Usage(USAGE))?,
                        percent: percent_arg(percent).ok_or(ParseError::Usage(USAGE))?,
                    },
                    _ => return Err(ParseError::Usage(USAGE)),
                }
            }
            "global" => match args.as_slice() {
                [percent] => Self::Global(percent_arg(percent).ok_or(ParseError::Usage("global <0-100>"))?),
                _ => return Err(ParseError::Usage("global <0-100>")),
            },
            "start" => Self::Start,
            "stop" => Self::Stop,
            "status" => match args.as_slice() {
                [] => Self::Status { json: false },
                ["json"] => Self::Status { json: true },
                _ => return Err(ParseError::Usage("status [json]")),
            },
            "refresh" => Self::Refresh,
            "help" => Self::Help,
            "exit" | "quit" => Self::Exit,
            _ => return Err(ParseError::Unknown),
        };
        Ok(command)
    }
}

fn index_arg(args: &[&str], usage: &'static str) -> Result<usize, ParseError> {
    match args {
        [index] => index.parse().map_err(|_| ParseError::Usage(usage)),
        _ => Err(ParseError::Usage(usage)),
    }
}

fn percent_arg(arg: &str) -> Option<f32> {
    arg.parse::<f32>().ok().filter(|v| v.is_finite())
}
