//! Interactive serial port selection.
//!
//! The port comes from, in order:
//! - the `--port` flag or `IAPFLASH_PORT`
//! - the `[port] serial` entry of the config file
//! - the single available port, or a prompt when there are several
//!
//! Non-interactive mode never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    iapflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection.
#[derive(Debug)]
pub struct SelectedPort {
    /// Port name/path.
    pub name: String,
    /// Whether the port was discovered rather than named by the user.
    pub from_discovery: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    // Selection problems are setup issues, exit code 2.
    CliError::Usage(message.to_string()).into()
}

/// List available ports, logging enumeration failures as "no ports".
pub(crate) fn discover_ports() -> Vec<PortInfo> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Port enumeration failed: {e}");
            Vec::new()
        },
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            from_discovery: false,
        });
    }

    if let Some(name) = &config.port.serial {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            from_discovery: false,
        });
    }

    let ports = discover_ports();

    match ports.len().cmp(&1) {
        Ordering::Less => Err(usage_err(
            "No serial ports found. Connect the target or pass --port",
        )),
        Ordering::Equal => {
            let port = ports
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("No serial ports found"))?;
            if options.non_interactive {
                info!("Auto-selected port: {}", port.name);
                Ok(SelectedPort {
                    name: port.name,
                    from_discovery: true,
                })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Greater => {
            if options.non_interactive {
                return Err(usage_err(
                    "Found multiple serial ports, use --port to choose one",
                ));
            }
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal, use --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

/// One-line description of a port for prompts and listings.
pub(crate) fn port_label(port: &PortInfo) -> String {
    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();
    format!("{}{vid_pid}{product}", port.name)
}

/// Interactive port selection.
fn select_port_interactive(ports: Vec<PortInfo>) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // Truncate labels to fit terminal width to prevent wrapping in narrow
    // terminals.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the serial port of the target")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                name: port.name,
                from_discovery: true,
            })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Confirm use of the only available port.
fn confirm_single_port(port: PortInfo) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", port_label(&port)))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            name: port.name,
            from_discovery: true,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(name: &str, config: &mut Config) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {name} for next time?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_port(name) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}
