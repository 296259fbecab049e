//! Line echo service
//!
//! The reference connection handler: greets the client, echoes every line
//! back prefixed with `+OK ` and ends the session on `QUIT`. A datagram gets
//! a single reply echoing each of its lines, without a greeting.

use mserver_core::exit::{EX_IOERR, EX_OK, EX_TEMPFAIL};
use mserver_core::Connection;
use std::io::{self, BufRead, BufReader, Write};
use tracing::{debug, warn};

/// Echo response builder
pub struct EchoResponse;

impl EchoResponse {
    /// Server greeting
    pub fn greeting(ident: &str) -> String {
        format!("+OK {} ready\r\n", ident)
    }

    /// Echoed line
    pub fn echo(line: &str) -> String {
        format!("+OK {}\r\n", line)
    }

    /// Farewell sent on QUIT
    pub fn bye() -> String {
        "+OK bye\r\n".to_string()
    }

    /// Negative response
    pub fn err(message: &str) -> String {
        format!("-ERR {}\r\n", message)
    }
}

/// Connection handler installed on the supervisor
pub fn serve_connection(mut conn: Connection, ident: &str) -> i32 {
    let peer = conn.peer().to_string();
    if let Some(payload) = conn.payload() {
        let reply = datagram_reply(payload);
        return match conn.write_all(reply.as_bytes()) {
            Ok(()) => EX_OK,
            Err(e) => {
                warn!("{}: cannot reply: {}", peer, e);
                EX_IOERR
            }
        };
    }

    let reader = match conn.try_clone() {
        Ok(reader) => BufReader::new(reader),
        Err(e) => {
            warn!("{}: cannot split connection: {}", peer, e);
            return EX_IOERR;
        }
    };
    let status = run_session(reader, conn, ident);
    debug!("{}: session ended with code {}", peer, status);
    status
}

/// Run one session and return its exit status: `EX_OK` on QUIT or EOF,
/// `EX_TEMPFAIL` on an idle timeout and `EX_IOERR` on any other I/O error.
pub fn run_session<R: BufRead, W: Write>(mut reader: R, mut writer: W, ident: &str) -> i32 {
    match session(&mut reader, &mut writer, ident) {
        Ok(()) => EX_OK,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            let _ = writer.write_all(EchoResponse::err("session timeout").as_bytes());
            EX_TEMPFAIL
        }
        Err(e) => {
            warn!("session error: {}", e);
            EX_IOERR
        }
    }
}

/// Reply to one datagram: every line echoed, in one message
pub fn datagram_reply(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .lines()
        .map(|line| EchoResponse::echo(line.trim_end_matches('\r')))
        .collect()
}

fn session<R: BufRead, W: Write>(reader: &mut R, writer: &mut W, ident: &str) -> io::Result<()> {
    writer.write_all(EchoResponse::greeting(ident).as_bytes())?;
    writer.flush()?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let text = line.trim_end_matches(['\r', '\n']);
        if text.eq_ignore_ascii_case("QUIT") {
            writer.write_all(EchoResponse::bye().as_bytes())?;
            return writer.flush();
        }
        writer.write_all(EchoResponse::echo(text).as_bytes())?;
        writer.flush()?;
    }
}
