//! Control commands: parsing, scripts and application.
//!
//! Topology files, command files and keyboard input share one line grammar:
//!
//! ```text
//! // comment | # comment
//! edge a b [lossRate <f64>] [delay <ms>] [bw <B/s>] [bt <ms>]
//! time [+ ]x
//! fail a [b]
//! restart a [b]
//! echo text
//! exit
//! a <msg>      (simulation: message for node a)
//! <msg>        (emulation: message for this node)
//! ```
//!
//! The parser only builds a [`Command`]. Applying it goes through a
//! [`CommandSink`], implemented by each backend and by the directory server.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use netbed_common::SimTime;
use netbed_link::LinkProfile;
use netbed_packet::NodeAddr;
use tracing::{debug, warn};

use crate::{CommandError, ScriptError};

// ============================================================================
// Commands
// ============================================================================

/// When commands after a `time` line may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGate {
    /// Milliseconds since the start of the run.
    At(Duration),
    /// Milliseconds after the time the line is processed.
    After(Duration),
}

impl TimeGate {
    /// Resolve against the time the line is processed.
    pub fn resolve(self, now: SimTime) -> SimTime {
        match self {
            TimeGate::At(at) => SimTime::ZERO + at,
            TimeGate::After(delay) => now + delay,
        }
    }
}

/// One parsed control command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create or update the link between `a` and `b`.
    Edge {
        a: NodeAddr,
        b: NodeAddr,
        profile: LinkProfile,
    },
    /// Fail node `a`, or the link `a`-`b`.
    Fail { a: NodeAddr, b: Option<NodeAddr> },
    /// Restart node `a`, or the link `a`-`b`.
    Restart { a: NodeAddr, b: Option<NodeAddr> },
    /// Print text.
    Echo(String),
    /// Stop the run.
    Exit,
    /// Defer the remaining commands.
    Time(TimeGate),
    /// Message for protocol code. `node` is `None` in emulation, where the
    /// only node is this process.
    Message { node: Option<NodeAddr>, text: String },
}

/// How lines that are not built-in commands are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// `a <msg>` sends `<msg>` to node `a`.
    Simulation,
    /// The whole line is a message for the local node.
    Emulation,
    /// Topology commands only.
    Directory,
}

/// Line parser for control commands.
#[derive(Debug, Clone)]
pub struct CommandParser {
    mode: CommandMode,
    default_profile: LinkProfile,
}

impl CommandParser {
    pub fn new(mode: CommandMode) -> Self {
        CommandParser {
            mode,
            default_profile: LinkProfile::default(),
        }
    }

    /// Profile used for `edge` options that are not given.
    pub fn with_default_profile(mut self, profile: LinkProfile) -> Self {
        self.default_profile = profile;
        self
    }

    pub fn mode(&self) -> CommandMode {
        self.mode
    }

    /// Parse one line. Blank lines and comments yield `Ok(None)`.
    pub fn parse_line(&self, line: &str) -> Result<Option<Command>, CommandError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(None);
        }
        let args: Vec<&str> = line.split(' ').collect();
        if args[0].starts_with("//") || args[0].starts_with('#') {
            return Ok(None);
        }

        let command = match args[0] {
            "edge" => self.parse_edge(line, &args)?,
            "fail" => {
                let (a, b) = parse_node_pair(&args).ok_or_else(|| CommandError::syntax("fail", line))?;
                Command::Fail { a, b }
            }
            "restart" => {
                let (a, b) =
                    parse_node_pair(&args).ok_or_else(|| CommandError::syntax("restart", line))?;
                Command::Restart { a, b }
            }
            "echo" => Command::Echo(args[1..].join(" ")),
            "exit" => Command::Exit,
            "time" => parse_time(&args)
                .map(Command::Time)
                .ok_or_else(|| CommandError::syntax("time", line))?,
            _ => self.parse_message(line, &args)?,
        };
        Ok(Some(command))
    }

    /// Options sit at fixed positions; which of them are present follows
    /// from the argument count.
    fn parse_edge(&self, line: &str, args: &[&str]) -> Result<Command, CommandError> {
        let syntax = || CommandError::syntax("edge", line);
        if !matches!(args.len(), 3 | 5 | 7 | 9 | 11) {
            return Err(syntax());
        }

        let mut profile = self.default_profile;
        if args.len() >= 11 {
            expect_keyword(args, 9, "bt").ok_or_else(syntax)?;
            profile.buffer_time = parse_millis(args[10]).ok_or_else(syntax)?;
        }
        if args.len() >= 9 {
            expect_keyword(args, 7, "bw").ok_or_else(syntax)?;
            profile.bandwidth = args[8].parse().map_err(|_| syntax())?;
        }
        if args.len() >= 7 {
            expect_keyword(args, 5, "delay").ok_or_else(syntax)?;
            profile.delay = parse_millis(args[6]).ok_or_else(syntax)?;
        }
        if args.len() >= 5 {
            expect_keyword(args, 3, "lossRate").ok_or_else(syntax)?;
            profile.loss_rate = args[4].parse().map_err(|_| syntax())?;
        }
        let a: NodeAddr = args[1].parse().map_err(|_| syntax())?;
        let b: NodeAddr = args[2].parse().map_err(|_| syntax())?;
        profile.validate()?;

        Ok(Command::Edge { a, b, profile })
    }

    fn parse_message(&self, line: &str, args: &[&str]) -> Result<Command, CommandError> {
        match self.mode {
            CommandMode::Simulation => {
                let node = args[0]
                    .parse::<NodeAddr>()
                    .map_err(|_| CommandError::Unrecognized(line.to_string()))?;
                let text = line
                    .split_once(' ')
                    .map(|(_, rest)| rest.to_string())
                    .unwrap_or_default();
                Ok(Command::Message {
                    node: Some(node),
                    text,
                })
            }
            CommandMode::Emulation => Ok(Command::Message {
                node: None,
                text: line.to_string(),
            }),
            CommandMode::Directory => Err(CommandError::Unrecognized(line.to_string())),
        }
    }
}

fn expect_keyword(args: &[&str], index: usize, keyword: &str) -> Option<()> {
    (args.get(index) == Some(&keyword)).then_some(())
}

fn parse_millis(s: &str) -> Option<Duration> {
    s.parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_node_pair(args: &[&str]) -> Option<(NodeAddr, Option<NodeAddr>)> {
    let a = args.get(1)?.parse().ok()?;
    let b = match args.get(2) {
        Some(s) => Some(s.parse().ok()?),
        None => None,
    };
    Some((a, b))
}

fn parse_time(args: &[&str]) -> Option<TimeGate> {
    if args.get(1) == Some(&"+") {
        parse_millis(args.get(2)?).map(TimeGate::After)
    } else {
        parse_millis(args.get(1)?).map(TimeGate::At)
    }
}

// ============================================================================
// Application
// ============================================================================

/// Receiver of control commands.
pub trait CommandSink {
    /// Create or update a link. Existing links keep their queue clocks.
    fn upsert_link(&mut self, a: NodeAddr, b: NodeAddr, profile: LinkProfile);

    /// Fail or restart a link. Returns `false` if there is no such link.
    fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, live: bool) -> bool;

    /// Fail or restart a node.
    fn set_node_live(&mut self, addr: NodeAddr, live: bool);

    /// Hand a message to protocol code. Returns `false` if there is no such
    /// node.
    fn deliver_message(&mut self, node: Option<NodeAddr>, text: &str) -> bool;

    /// Stop after the current iteration.
    fn request_exit(&mut self);
}

/// Apply a command. Returns the time gate a `time` command sets.
pub fn apply<S: CommandSink + ?Sized>(sink: &mut S, command: Command, now: SimTime) -> Option<SimTime> {
    match command {
        Command::Edge { a, b, profile } => sink.upsert_link(a, b, profile),
        Command::Fail { a, b: Some(b) } => {
            if !sink.set_link_live(a, b, false) {
                warn!("No edge exists between node {a} and node {b}");
            }
        }
        Command::Fail { a, b: None } => sink.set_node_live(a, false),
        Command::Restart { a, b: Some(b) } => {
            if !sink.set_link_live(a, b, true) {
                warn!("No edge exists between node {a} and node {b}");
            }
        }
        Command::Restart { a, b: None } => sink.set_node_live(a, true),
        Command::Echo(text) => println!("{text}"),
        Command::Exit => sink.request_exit(),
        Command::Time(gate) => return Some(gate.resolve(now)),
        Command::Message { node, text } => {
            if !sink.deliver_message(node, &text) {
                warn!(?node, "No node to deliver message to");
            }
        }
    }
    None
}

/// Parse and apply one line, logging parse errors. Returns the time gate a
/// `time` command sets.
pub fn execute_line<S: CommandSink + ?Sized>(
    sink: &mut S,
    parser: &CommandParser,
    line: &str,
    now: SimTime,
) -> Option<SimTime> {
    match parser.parse_line(line) {
        Ok(Some(command)) => {
            debug!(%now, ?command, "Applying command");
            apply(sink, command, now)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Ignoring command line");
            None
        }
    }
}

// ============================================================================
// Scripts
// ============================================================================

/// A command file consumed under `time` gates.
#[derive(Debug, Clone, Default)]
pub struct CommandScript {
    lines: VecDeque<String>,
    gate: SimTime,
}

impl CommandScript {
    /// Read a script from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Build a script from text.
    pub fn parse(text: &str) -> Self {
        CommandScript {
            lines: text.lines().map(str::to_string).collect(),
            gate: SimTime::ZERO,
        }
    }

    /// All lines consumed.
    pub fn is_finished(&self) -> bool {
        self.lines.is_empty()
    }

    /// Earliest time the next line may run, or `None` once finished.
    pub fn gate(&self) -> Option<SimTime> {
        (!self.is_finished()).then_some(self.gate)
    }

    /// Hold remaining lines until `at`.
    pub fn defer_until(&mut self, at: SimTime) {
        self.gate = at;
    }

    /// Take the next line if its gate has passed. Nothing is released at
    /// time zero.
    pub fn next_due(&mut self, now: SimTime) -> Option<String> {
        if now == SimTime::ZERO || now < self.gate {
            return None;
        }
        self.lines.pop_front()
    }

    /// Apply lines until one sets a time gate, ignoring gates on entry.
    /// Returns that gate, or `None` once the script is exhausted.
    pub fn run_until_gate<S: CommandSink + ?Sized>(
        &mut self,
        parser: &CommandParser,
        sink: &mut S,
        now: SimTime,
    ) -> Option<SimTime> {
        while let Some(line) = self.lines.pop_front() {
            if let Some(gate) = execute_line(sink, parser, &line, now) {
                self.gate = gate;
                return Some(gate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> NodeAddr {
        NodeAddr(n)
    }

    fn sim() -> CommandParser {
        CommandParser::new(CommandMode::Simulation)
    }

    #[derive(Default)]
    struct Recorder {
        links: Vec<(NodeAddr, NodeAddr, LinkProfile)>,
        link_state: Vec<(NodeAddr, NodeAddr, bool)>,
        node_state: Vec<(NodeAddr, bool)>,
        messages: Vec<(Option<NodeAddr>, String)>,
        exit: bool,
    }

    impl CommandSink for Recorder {
        fn upsert_link(&mut self, a: NodeAddr, b: NodeAddr, profile: LinkProfile) {
            self.links.push((a, b, profile));
        }

        fn set_link_live(&mut self, a: NodeAddr, b: NodeAddr, live: bool) -> bool {
            self.link_state.push((a, b, live));
            true
        }

        fn set_node_live(&mut self, addr: NodeAddr, live: bool) {
            self.node_state.push((addr, live));
        }

        fn deliver_message(&mut self, node: Option<NodeAddr>, text: &str) -> bool {
            self.messages.push((node, text.to_string()));
            true
        }

        fn request_exit(&mut self) {
            self.exit = true;
        }
    }

    #[test]
    fn test_comments_and_blank_lines() {
        assert_eq!(sim().parse_line(""), Ok(None));
        assert_eq!(sim().parse_line("// edge 0 1"), Ok(None));
        assert_eq!(sim().parse_line("#comment"), Ok(None));
    }

    #[test]
    fn test_edge_defaults() {
        assert_eq!(
            sim().parse_line("edge 0 1"),
            Ok(Some(Command::Edge {
                a: addr(0),
                b: addr(1),
                profile: LinkProfile::default()
            }))
        );
    }

    #[test]
    fn test_edge_all_options() {
        let command = sim()
            .parse_line("edge 2 3 lossRate 0.5 delay 20 bw 500 bt 100")
            .unwrap()
            .unwrap();
        let expected = LinkProfile::default()
            .with_loss_rate(0.5)
            .with_delay(Duration::from_millis(20))
            .with_bandwidth(500)
            .with_buffer_time(Duration::from_millis(100));
        assert_eq!(
            command,
            Command::Edge {
                a: addr(2),
                b: addr(3),
                profile: expected
            }
        );
    }

    #[test]
    fn test_edge_partial_options() {
        let Some(Command::Edge { profile, .. }) =
            sim().parse_line("edge 0 1 lossRate 0.1 delay 7").unwrap()
        else {
            panic!("expected edge");
        };
        assert_eq!(profile.loss_rate, 0.1);
        assert_eq!(profile.delay, Duration::from_millis(7));
        assert_eq!(profile.bandwidth, LinkProfile::default().bandwidth);
    }

    #[test]
    fn test_edge_errors() {
        // Options are positional
        assert!(sim().parse_line("edge 0 1 delay 5").is_err());
        assert!(sim().parse_line("edge 0 1 lossRate").is_err());
        assert!(sim().parse_line("edge 0 x").is_err());
        assert!(matches!(
            sim().parse_line("edge 0 1 lossRate 2.0"),
            Err(CommandError::Link(_))
        ));
    }

    #[test]
    fn test_edge_uses_parser_default_profile() {
        let defaults = LinkProfile::default().with_bandwidth(42);
        let parser = sim().with_default_profile(defaults);
        let Some(Command::Edge { profile, .. }) = parser.parse_line("edge 0 1").unwrap() else {
            panic!("expected edge");
        };
        assert_eq!(profile.bandwidth, 42);
    }

    #[test]
    fn test_fail_restart() {
        assert_eq!(
            sim().parse_line("fail 3"),
            Ok(Some(Command::Fail { a: addr(3), b: None }))
        );
        assert_eq!(
            sim().parse_line("restart 3 4"),
            Ok(Some(Command::Restart {
                a: addr(3),
                b: Some(addr(4))
            }))
        );
        assert!(sim().parse_line("fail").is_err());
    }

    #[test]
    fn test_time() {
        assert_eq!(
            sim().parse_line("time 500"),
            Ok(Some(Command::Time(TimeGate::At(Duration::from_millis(500)))))
        );
        assert_eq!(
            sim().parse_line("time + 20"),
            Ok(Some(Command::Time(TimeGate::After(Duration::from_millis(20)))))
        );
        let now = SimTime::from_millis(100);
        assert_eq!(TimeGate::After(Duration::from_millis(20)).resolve(now), SimTime::from_millis(120));
        assert_eq!(TimeGate::At(Duration::from_millis(20)).resolve(now), SimTime::from_millis(20));
        assert!(sim().parse_line("time soon").is_err());
    }

    #[test]
    fn test_messages_by_mode() {
        assert_eq!(
            sim().parse_line("4 7 hello world"),
            Ok(Some(Command::Message {
                node: Some(addr(4)),
                text: "7 hello world".to_string()
            }))
        );
        assert!(matches!(
            sim().parse_line("hello"),
            Err(CommandError::Unrecognized(_))
        ));
        assert_eq!(
            CommandParser::new(CommandMode::Emulation).parse_line("7 hello"),
            Ok(Some(Command::Message {
                node: None,
                text: "7 hello".to_string()
            }))
        );
        assert!(CommandParser::new(CommandMode::Directory)
            .parse_line("7 hello")
            .is_err());
    }

    #[test]
    fn test_apply() {
        let mut sink = Recorder::default();
        let now = SimTime::from_millis(10);
        let parser = sim();

        assert_eq!(execute_line(&mut sink, &parser, "edge 0 1", now), None);
        assert_eq!(execute_line(&mut sink, &parser, "fail 0 1", now), None);
        assert_eq!(execute_line(&mut sink, &parser, "restart 1", now), None);
        assert_eq!(execute_line(&mut sink, &parser, "1 ping", now), None);
        assert_eq!(
            execute_line(&mut sink, &parser, "time + 5", now),
            Some(SimTime::from_millis(15))
        );
        assert_eq!(execute_line(&mut sink, &parser, "bogus", now), None);
        execute_line(&mut sink, &parser, "exit", now);

        assert_eq!(sink.links.len(), 1);
        assert_eq!(sink.link_state, vec![(addr(0), addr(1), false)]);
        assert_eq!(sink.node_state, vec![(addr(1), true)]);
        assert_eq!(sink.messages, vec![(Some(addr(1)), "ping".to_string())]);
        assert!(sink.exit);
    }

    #[test]
    fn test_script_gates() {
        let mut script = CommandScript::parse("1 a\ntime 50\n1 b\n");

        // Never released at time zero
        assert_eq!(script.next_due(SimTime::ZERO), None);
        assert_eq!(script.next_due(SimTime::from_micros(1)), Some("1 a".to_string()));
        assert_eq!(script.next_due(SimTime::from_micros(1)), Some("time 50".to_string()));

        script.defer_until(SimTime::from_millis(50));
        assert_eq!(script.gate(), Some(SimTime::from_millis(50)));
        assert_eq!(script.next_due(SimTime::from_millis(49)), None);
        assert_eq!(script.next_due(SimTime::from_millis(50)), Some("1 b".to_string()));
        assert!(script.is_finished());
        assert_eq!(script.gate(), None);
    }

    #[test]
    fn test_script_run_until_gate() {
        let mut script = CommandScript::parse("edge 0 1\nedge 1 2\ntime 100\nfail 1\n");
        let mut sink = Recorder::default();
        let parser = sim();

        let gate = script.run_until_gate(&parser, &mut sink, SimTime::ZERO);
        assert_eq!(gate, Some(SimTime::from_millis(100)));
        assert_eq!(sink.links.len(), 2);
        assert!(sink.node_state.is_empty());

        let gate = script.run_until_gate(&parser, &mut sink, SimTime::from_millis(100));
        assert_eq!(gate, None);
        assert_eq!(sink.node_state, vec![(addr(1), false)]);
        assert!(script.is_finished());
    }
}
