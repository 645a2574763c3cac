use std::fmt::{Display, Formatter};
use std::io::Write;
use std::time::Duration;

use tracing::debug;

use crate::fault_rules::{FaultKind, FaultRule, FaultRuleQueue};
use crate::packet::{hex_dump, Opcode};

const COMMAND_LIST: &[&str] = &[
    "~~~~~~~~~~~ COMMAND LIST ~~~~~~~~~~~",
    "'help'              - print all commands and how to use them",
    "'clear'             - clear screen",
    "'close'             - exit, close ports, be graceful",
    "'verbose BOOL'      - toggle verbose mode as true or false",
    "'test'              - runs a test for the console",
    "'errors'            - display a summary of all errors to be simulated",
    "'run'               - finalize the errors to simulate & start the relay",
    "",
    "'delay PT BN DL'    - delay packet type PT, block number BN by DL seconds",
    "'dup PT BN'         - duplicate packet type PT, block number BN",
    "'lose PT BN'        - lose packet type PT, block number BN",
    "",
    "PT is 'data', 'ack' or a numeric opcode; '0', '1' and '2' are short for delay, dup and lose",
    "~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~",
    "You must enter run once all desired errors are entered in order to start the simulator.",
    "The simulator is not ready for data before run is entered.",
    "~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~",
];

const CLEAR_SCREEN: &str = "\x1B[2J\x1B[1;1H";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Help,
    Clear,
    Close,
    Verbose(bool),
    Test,
    Errors,
    Run,
    AddRule(FaultRule),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommandError {
    Unknown,
    NotANumber(String),
}
impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Unknown => write!(f, "! Unknown Input !"),
            CommandError::NotANumber(s) => write!(f, "Error 2 - NAN: '{}' is not a number", s),
        }
    }
}

impl Command {
    /// `Ok(None)` for blank lines
    pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
        let tokens = line.split_whitespace().collect::<Vec<_>>();

        let command = match tokens.as_slice() {
            [] => return Ok(None),
            ["help"] => Command::Help,
            ["clear"] => Command::Clear,
            ["close"] => Command::Close,
            ["test"] => Command::Test,
            ["errors"] => Command::Errors,
            ["run"] => Command::Run,
            ["verbose", "true"] => Command::Verbose(true),
            ["verbose", "false"] => Command::Verbose(false),
            ["delay" | "0", opcode, block, seconds] => {
                let opcode = parse_opcode(opcode)?;
                let block = parse_number(block)?;
                let seconds: u64 = parse_number(seconds)?;
                Command::AddRule(FaultRule::new(FaultKind::Delay(Duration::from_secs(seconds)), opcode, block))
            }
            ["dup" | "1", opcode, block] => Command::AddRule(FaultRule::new(FaultKind::Duplicate, parse_opcode(opcode)?, parse_number(block)?)),
            ["lose" | "2", opcode, block] => Command::AddRule(FaultRule::new(FaultKind::Lose, parse_opcode(opcode)?, parse_number(block)?)),
            _ => return Err(CommandError::Unknown),
        };
        Ok(Some(command))
    }
}

fn parse_opcode(s: &str) -> Result<u16, CommandError> {
    match s {
        "data" => Ok(Opcode::Data.into()),
        "ack" => Ok(Opcode::Ack.into()),
        _ => parse_number(s),
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, CommandError> {
    s.parse()
        .map_err(|_| CommandError::NotANumber(s.to_string()))
}


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConsoleAction {
    Continue,
    /// terminate the process
    Close,
    /// freeze the fault rules and start relaying
    Run,
}

/// The operator's line oriented interface for queueing fault rules before the relay starts
pub struct Console<W: Write> {
    out: W,
    fault_rules: FaultRuleQueue,
    verbose: bool,
}

impl <W: Write> Console<W> {
    pub fn new(out: W) -> Console<W> {
        Console {
            out,
            fault_rules: FaultRuleQueue::new(),
            verbose: false,
        }
    }

    pub fn fault_rules(&self) -> &FaultRuleQueue {
        &self.fault_rules
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// hands over the fault rules for running the relay
    pub fn into_parts(self) -> (FaultRuleQueue, bool) {
        (self.fault_rules, self.verbose)
    }

    pub fn print_banner(&mut self) -> std::io::Result<()> {
        writeln!(self.out, "type 'help' for command list")?;
        self.print_help()
    }

    fn print_help(&mut self) -> std::io::Result<()> {
        for line in COMMAND_LIST {
            writeln!(self.out, "{}", line)?;
        }
        writeln!(self.out)
    }

    pub fn handle_line(&mut self, line: &str) -> std::io::Result<ConsoleAction> {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(ConsoleAction::Continue),
            Err(e) => {
                writeln!(self.out, "{}", e)?;
                return Ok(ConsoleAction::Continue);
            }
        };
        debug!(?command, "console command");

        match command {
            Command::Help => self.print_help()?,
            Command::Clear => write!(self.out, "{}", CLEAR_SCREEN)?,
            Command::Close => {
                writeln!(self.out, "Closing with grace....")?;
                return Ok(ConsoleAction::Close);
            }
            Command::Verbose(verbose) => {
                self.verbose = verbose;
                writeln!(self.out, "verbose mode {}", if verbose { "on" } else { "off" })?;
            }
            Command::Test => self.self_check()?,
            Command::Errors => writeln!(self.out, "{}", self.fault_rules)?,
            Command::Run => {
                writeln!(self.out, "starting the relay with {} error(s) to simulate", self.fault_rules.len())?;
                return Ok(ConsoleAction::Run);
            }
            Command::AddRule(rule) => {
                self.fault_rules.push(rule);
                writeln!(self.out, "queued: {}", rule)?;
            }
        }
        Ok(ConsoleAction::Continue)
    }

    /// exercises the console's output and command parsing without touching its state
    fn self_check(&mut self) -> std::io::Result<()> {
        writeln!(self.out, "console self-check")?;
        writeln!(self.out, "{}", hex_dump(b"\0\x03\0\x01console self-check"))?;

        for sample in ["help", "verbose true", "delay data 1 10", "dup ack 2", "lose 5 0", "delay data x 1", "jump"] {
            match Command::parse(sample) {
                Ok(command) => writeln!(self.out, "  '{}' -> {:?}", sample, command)?,
                Err(e) => writeln!(self.out, "  '{}' -> {}", sample, e)?,
            }
        }
        writeln!(self.out, "console self-check complete")
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    const DATA: u16 = 3;
    const ACK: u16 = 4;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[rstest]
    #[case::blank("", Ok(None))]
    #[case::whitespace("   ", Ok(None))]
    #[case::help("help", Ok(Some(Command::Help)))]
    #[case::clear("clear", Ok(Some(Command::Clear)))]
    #[case::close("close", Ok(Some(Command::Close)))]
    #[case::test("test", Ok(Some(Command::Test)))]
    #[case::errors("errors", Ok(Some(Command::Errors)))]
    #[case::run(" run ", Ok(Some(Command::Run)))]
    #[case::verbose_on("verbose true", Ok(Some(Command::Verbose(true))))]
    #[case::verbose_off("verbose   false", Ok(Some(Command::Verbose(false))))]
    #[case::verbose_other("verbose yes", Err(CommandError::Unknown))]
    #[case::delay("delay data 1 10", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Delay(secs(10)), DATA, 1)))))]
    #[case::delay_short("0 ack 3 2", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Delay(secs(2)), ACK, 3)))))]
    #[case::dup("dup ack 2", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Duplicate, ACK, 2)))))]
    #[case::dup_short("1 data 0", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Duplicate, DATA, 0)))))]
    #[case::lose_raw_opcode("lose 5 0", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Lose, 5, 0)))))]
    #[case::lose_short("2 3 65535", Ok(Some(Command::AddRule(FaultRule::new(FaultKind::Lose, DATA, 65535)))))]
    #[case::nan_opcode("lose x 1", Err(CommandError::NotANumber("x".to_string())))]
    #[case::nan_block("dup data one", Err(CommandError::NotANumber("one".to_string())))]
    #[case::nan_delay("delay data 1 soon", Err(CommandError::NotANumber("soon".to_string())))]
    #[case::block_out_of_range("lose data 65536", Err(CommandError::NotANumber("65536".to_string())))]
    #[case::negative_delay("delay data 1 -5", Err(CommandError::NotANumber("-5".to_string())))]
    #[case::wrong_arity("dup data", Err(CommandError::Unknown))]
    #[case::delay_missing_seconds("delay data 1", Err(CommandError::Unknown))]
    #[case::unknown("jump", Err(CommandError::Unknown))]
    #[case::case_sensitive("HELP", Err(CommandError::Unknown))]
    fn test_parse(#[case] line: &str, #[case] expected: Result<Option<Command>, CommandError>) {
        assert_eq!(Command::parse(line), expected);
    }

    fn output(console: &Console<Vec<u8>>) -> String {
        String::from_utf8_lossy(&console.out).to_string()
    }

    #[test]
    fn test_queue_rules_and_show_errors() {
        let mut console = Console::new(Vec::new());

        assert_eq!(console.handle_line("delay data 1 10").unwrap(), ConsoleAction::Continue);
        assert_eq!(console.handle_line("lose ack 2").unwrap(), ConsoleAction::Continue);
        assert_eq!(console.handle_line("errors").unwrap(), ConsoleAction::Continue);

        assert_eq!(console.fault_rules().len(), 2);
        assert!(output(&console).contains("1: delay by 10s DATA #1\n2: lose ACK #2\n"));
    }

    #[rstest]
    #[case("lose data x", "Error 2 - NAN: 'x' is not a number\n")]
    #[case("lose data", "! Unknown Input !\n")]
    fn test_malformed_input_leaves_queue_unchanged(#[case] line: &str, #[case] expected_output: &str) {
        let mut console = Console::new(Vec::new());
        console.handle_line("dup data 1").unwrap();
        console.out.clear();

        assert_eq!(console.handle_line(line).unwrap(), ConsoleAction::Continue);
        assert_eq!(output(&console), expected_output);
        assert_eq!(console.fault_rules().len(), 1);
    }

    #[test]
    fn test_verbose() {
        let mut console = Console::new(Vec::new());
        assert!(!console.verbose());
        console.handle_line("verbose true").unwrap();
        assert!(console.verbose());
        console.handle_line("verbose false").unwrap();
        assert!(!console.verbose());
    }

    #[rstest]
    #[case("close", ConsoleAction::Close)]
    #[case("run", ConsoleAction::Run)]
    #[case("help", ConsoleAction::Continue)]
    #[case("clear", ConsoleAction::Continue)]
    #[case("", ConsoleAction::Continue)]
    fn test_actions(#[case] line: &str, #[case] expected: ConsoleAction) {
        let mut console = Console::new(Vec::new());
        assert_eq!(console.handle_line(line).unwrap(), expected);
    }

    #[test]
    fn test_into_parts() {
        let mut console = Console::new(Vec::new());
        console.handle_line("verbose true").unwrap();
        console.handle_line("lose data 3").unwrap();

        let (fault_rules, verbose) = console.into_parts();
        assert!(verbose);
        assert_eq!(fault_rules.peek_current(), Some(&FaultRule::new(FaultKind::Lose, DATA, 3)));
    }

    #[test]
    fn test_self_check_does_not_change_state() {
        let mut console = Console::new(Vec::new());
        console.handle_line("test").unwrap();

        let output = output(&console);
        assert!(output.starts_with("console self-check\n"));
        assert!(output.contains("'delay data x 1' -> Error 2 - NAN"));
        assert!(output.ends_with("console self-check complete\n"));
        assert!(console.fault_rules().is_empty());
        assert!(!console.verbose());
    }

    #[test]
    fn test_banner() {
        let mut console = Console::new(Vec::new());
        console.print_banner().unwrap();
        assert!(output(&console).contains("'delay PT BN DL'"));
    }
}
