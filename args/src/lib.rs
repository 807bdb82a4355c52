// SPDX-License-Identifier: Apache-2.0
// Copyright uswitch Authors

//! Command-line surface of the forwarding process.
//!
//! The load-bearing option is `--config`, a list of `(port,queue,lcore)`
//! triples binding physical port queues to forwarding cores. The remaining
//! options size the guest-facing port populations and place the control and
//! client-switching work.

pub use clap::Parser;

/// One `(port,queue,lcore)` binding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortQueueLcore {
    /// Physical port index.
    pub port: u32,
    /// Rx queue on that port.
    pub queue: u32,
    /// Core that polls it.
    pub lcore: u32,
}

/// Parsed `--config` value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreBindings(pub Vec<PortQueueLcore>);

/// Errors from `--config` parsing and cross-option validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArgsError {
    #[error("malformed (port,queue,lcore) triple: {0:?}")]
    BadTriple(String),
    #[error("duplicate binding for port {port} queue {queue}")]
    DuplicateBinding { port: u32, queue: u32 },
    #[error("core {0} is bound to packet work and to the control channel")]
    ControlCoreCollision(u32),
}

fn parse_bindings(raw: &str) -> Result<CoreBindings, ArgsError> {
    let mut out = Vec::new();
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Ok(CoreBindings(out));
    }
    for triple in cleaned.split("),(") {
        let triple = triple.trim_start_matches('(').trim_end_matches(')');
        let fields: Vec<&str> = triple.split(',').collect();
        let [port, queue, lcore] = fields[..] else {
            return Err(ArgsError::BadTriple(triple.to_string()));
        };
        let parse = |field: &str| {
            field
                .parse::<u32>()
                .map_err(|_| ArgsError::BadTriple(triple.to_string()))
        };
        out.push(PortQueueLcore {
            port: parse(port)?,
            queue: parse(queue)?,
            lcore: parse(lcore)?,
        });
    }
    Ok(CoreBindings(out))
}

fn bindings_value(raw: &str) -> Result<CoreBindings, String> {
    parse_bindings(raw).map_err(|err| err.to_string())
}

/// The forwarding process's command line.
#[derive(Parser, Clone, Debug)]
#[command(name = "uswitch-dataplane", about = "userspace poll-mode packet switch")]
pub struct CmdArgs {
    /// Core-to-port bindings: "(port,queue,lcore)[,(port,queue,lcore)...]"
    #[arg(long, value_parser = bindings_value, default_value = "")]
    pub config: CoreBindings,

    /// Seconds between statistics displays; 0 disables the display job.
    #[arg(long, default_value_t = 0)]
    pub stats: u64,

    /// Core that services the control channel (the master core).
    #[arg(long, default_value_t = 0)]
    pub vswitchd: u32,

    /// Core that switches guest-ring traffic.
    #[arg(long = "client_switching_core", default_value_t = 1)]
    pub client_switching_core: u32,

    /// Number of guest client ports.
    #[arg(long, default_value_t = 0)]
    pub clients: u32,

    /// Number of KNI ports.
    #[arg(long, default_value_t = 0)]
    pub kni: u32,

    /// Number of veth ports.
    #[arg(long, default_value_t = 0)]
    pub veth: u32,

    /// Number of vhost ports.
    #[arg(long, default_value_t = 0)]
    pub vhost: u32,

    /// Number of memnic ports.
    #[arg(long, default_value_t = 0)]
    pub memnic: u32,
}

impl CmdArgs {
    /// Cross-option checks the derive cannot express.
    ///
    /// # Errors
    ///
    /// [`ArgsError`] naming the offending option.
    pub fn validate(&self) -> Result<(), ArgsError> {
        let mut seen = Vec::new();
        for binding in &self.config.0 {
            if seen.contains(&(binding.port, binding.queue)) {
                return Err(ArgsError::DuplicateBinding {
                    port: binding.port,
                    queue: binding.queue,
                });
            }
            seen.push((binding.port, binding.queue));
            if binding.lcore == self.vswitchd {
                return Err(ArgsError::ControlCoreCollision(binding.lcore));
            }
        }
        if self.client_switching_core == self.vswitchd {
            return Err(ArgsError::ControlCoreCollision(self.vswitchd));
        }
        Ok(())
    }

    /// Every forwarding core named on the command line, deduplicated.
    #[must_use]
    pub fn forwarding_cores(&self) -> Vec<u32> {
        let mut cores: Vec<u32> = self
            .config
            .0
            .iter()
            .map(|binding| binding.lcore)
            .chain(std::iter::once(self.client_switching_core))
            .collect();
        cores.sort_unstable();
        cores.dedup();
        cores
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_single_and_multiple_triples() {
        let one = parse_bindings("(0,0,2)").unwrap();
        assert_eq!(
            one.0,
            vec![PortQueueLcore {
                port: 0,
                queue: 0,
                lcore: 2
            }]
        );

        let many = parse_bindings("(0,0,2),(1,0,3)").unwrap();
        assert_eq!(many.0.len(), 2);
        assert_eq!(many.0[1].lcore, 3);
    }

    #[test]
    fn tolerates_whitespace() {
        let parsed = parse_bindings(" (0, 0, 2) , (1, 0, 3) ").unwrap();
        assert_eq!(parsed.0.len(), 2);
    }

    #[test]
    fn rejects_malformed_triples() {
        assert!(matches!(
            parse_bindings("(0,0)"),
            Err(ArgsError::BadTriple(_))
        ));
        assert!(matches!(
            parse_bindings("(a,b,c)"),
            Err(ArgsError::BadTriple(_))
        ));
    }

    #[test]
    fn full_command_line() {
        let args = CmdArgs::parse_from([
            "uswitch-dataplane",
            "--config",
            "(0,0,2),(1,0,3)",
            "--stats",
            "5",
            "--vswitchd",
            "0",
            "--client_switching_core",
            "1",
            "--clients",
            "2",
            "--kni",
            "1",
        ]);
        args.validate().unwrap();
        assert_eq!(args.stats, 5);
        assert_eq!(args.clients, 2);
        assert_eq!(args.forwarding_cores(), vec![1, 2, 3]);
    }

    #[test]
    fn validation_catches_collisions() {
        let args = CmdArgs::parse_from([
            "uswitch-dataplane",
            "--config",
            "(0,0,0)",
        ]);
        assert_eq!(
            args.validate().unwrap_err(),
            ArgsError::ControlCoreCollision(0)
        );

        let args = CmdArgs::parse_from([
            "uswitch-dataplane",
            "--config",
            "(0,0,2),(0,0,3)",
        ]);
        assert!(matches!(
            args.validate().unwrap_err(),
            ArgsError::DuplicateBinding { port: 0, queue: 0 }
        ));
    }
}
