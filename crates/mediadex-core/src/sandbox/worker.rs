/// Worker side of the sandbox protocol.
///
/// Runs inside the child process: reads one request per line from `input`,
/// answers each with exactly one line on `output`, and returns when `input`
/// reaches EOF (the parent closed our stdin). Malformed requests are answered
/// with an empty line so the two sides never fall out of step.
use super::protocol::{self, Request};
use crate::error::Result;
use crate::probe::Prober;
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};

pub fn serve<R: BufRead, W: Write>(input: R, mut output: W, prober: &dyn Prober) -> Result<()> {
    info!("Sandbox worker: ready");
    for line in input.lines() {
        let line = line?;
        let response = match Request::decode(&line) {
            Ok(Request::Probe { kind, paths }) => {
                let records: Vec<_> = paths
                    .iter()
                    .filter_map(|path| match prober.probe(kind, path) {
                        Ok(record) => Some(record),
                        Err(e) => {
                            debug!("Sandbox worker: {} probe of {:?} failed: {}", kind, path, e);
                            None
                        }
                    })
                    .collect();
                protocol::encode_probe_response(&records)?
            }
            Ok(Request::Thumbnail { max_edge, path }) => {
                let png = prober.thumbnail(&path, max_edge).unwrap_or_else(|e| {
                    debug!("Sandbox worker: thumbnail of {:?} failed: {}", path, e);
                    None
                });
                protocol::encode_thumbnail_response(png.as_deref())
            }
            Err(e) => {
                warn!("Sandbox worker: {}", e);
                String::new()
            }
        };
        output.write_all(response.as_bytes())?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    info!("Sandbox worker: input closed, exiting");
    Ok(())
}
