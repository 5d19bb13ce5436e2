use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read};

use consoled_frame::FrameFilter;
use tracing::debug;

use crate::cmd::DecodeArgs;
use crate::exit::{io_error, CliResult, SUCCESS};
use crate::output::{print_decoded, Decoded, OutputFormat};

const READ_CHUNK: usize = 4096;

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let (items, stats) = match &args.file {
        Some(path) => {
            let file = File::open(path)
                .map_err(|err| io_error(&format!("open {}", path.display()), err))?;
            decode_stream(file, args.max_frame_len)
        }
        None => decode_stream(io::stdin().lock(), args.max_frame_len),
    }
    .map_err(|err| io_error("read failed", err))?;

    debug!(?stats, "capture decoded");
    print_decoded(&items, stats, format);
    Ok(SUCCESS)
}

/// Run a whole capture through a filter, as if the line went idle at the end.
fn decode_stream<R: Read>(
    mut reader: R,
    max_frame_len: usize,
) -> io::Result<(Vec<Decoded>, consoled_frame::FilterStats)> {
    let items = RefCell::new(Vec::new());
    let stats = {
        let mut filter = FrameFilter::new()
            .with_max_frame_len(max_frame_len)
            .on_frame(|frame| items.borrow_mut().push(Decoded::Frame(frame)))
            .on_user_data(|data| items.borrow_mut().push(Decoded::UserData(data.to_vec())));

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => filter.process(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        filter.abandon_partial();
        filter.on_timeout();
        filter.stats()
    };
    Ok((items.into_inner(), stats))
}
