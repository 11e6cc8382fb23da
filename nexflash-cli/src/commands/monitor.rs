//! Serial monitor command implementation.
//!
//! Dual-threaded monitor: a reader thread streams display output to the
//! terminal while the main thread forwards keystrokes to the display.

use anyhow::{Context, Result};
use console::style;
use nexflash::{MonitorSession, drain_utf8_lossy};
use std::io::{self, Write as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, get_port, was_interrupted};

/// Run the serial monitor.
///
/// - Reader thread: serial → terminal (lossy UTF-8)
/// - Main thread: keyboard (crossterm raw mode) → serial
/// - Enter sends the display's three-byte command terminator, so typed
///   instructions execute
/// - Ctrl+C: exit
pub(crate) fn cmd_monitor(cli: &Cli, config: &mut Config, monitor_baud: u32) -> Result<()> {
    use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
    use crossterm::terminal;
    use std::io::Read as _;

    let port_name = get_port(cli, config)?;

    eprintln!(
        "{} Opening monitor on {} at {} bps",
        style("📡").cyan(),
        style(&port_name).green(),
        monitor_baud
    );
    eprintln!(
        "{}",
        style("Type commands and press Enter to send them; Ctrl+C to exit.").dim()
    );

    let session = MonitorSession::open(&port_name, monitor_baud)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    let mut reader = session
        .try_clone_reader()
        .context("Failed to clone serial reader")?;
    let mut writer = session;

    let running = Arc::new(AtomicBool::new(true));
    let reader_running = Arc::clone(&running);

    let reader_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        let mut pending: Vec<u8> = Vec::new();

        while reader_running.load(Ordering::Relaxed) {
            match reader.read(&mut buf) {
                Ok(n) if n > 0 => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = drain_utf8_lossy(&mut pending);
                    if !text.is_empty() {
                        // Raw mode needs explicit carriage returns.
                        print!("{}", text.replace('\n', "\r\n"));
                        io::stdout().flush().ok();
                    }
                },
                Ok(_) => {},
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {},
                Err(_) => break,
            }
        }
    });

    terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;

    let result = (|| -> Result<()> {
        loop {
            if was_interrupted() {
                return Ok(());
            }
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            if let Event::Key(KeyEvent {
                code, modifiers, ..
            }) = event::read()?
            {
                match (code, modifiers) {
                    (KeyCode::Char('c'), KeyModifiers::CONTROL) => return Ok(()),
                    (KeyCode::Enter, _) => {
                        // Terminate the typed instruction so the display
                        // executes it.
                        writer.write_bytes(&[0xFF, 0xFF, 0xFF])?;
                    },
                    (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
                        let mut utf8 = [0u8; 4];
                        writer.write_bytes(c.encode_utf8(&mut utf8).as_bytes())?;
                    },
                    _ => {},
                }
            }
        }
    })();

    terminal::disable_raw_mode().ok();
    running.store(false, Ordering::Relaxed);
    reader_thread.join().ok();

    eprintln!("\n{} Monitor closed", style("✓").green());
    result
}
