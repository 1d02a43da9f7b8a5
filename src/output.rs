use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

/// A row of output: shown as table/CSV cells or serialized as a JSON line.
pub trait Record: serde::Serialize {
    const HEADERS: &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

impl Args {
    pub fn to_output<R: Record>(self) -> Result<Output<R>, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        let formatter = match &self.format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy
                    .set_header(R::HEADERS.to_vec())
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv,
        };
        let mut output = Output { path: self.output, io, formatter, record: std::marker::PhantomData };
        if let Formatter::Csv = output.formatter {
            output.write_csv_row(R::HEADERS)?;
        }
        Ok(output)
    }
}

pub struct Output<R> {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
    record: std::marker::PhantomData<fn(&R)>,
}

enum Formatter {
    Csv,
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl<R: Record> Output<R> {
    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let line = encode_csv_row(values);
        self.io.write_all(&line).map_err(|e| self.write_error(e))
    }

    pub fn record(&mut self, record: &R) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv => {
                let values = record.cells();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(record.cells());
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, record).map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            writeln!(self.io, "{comfy}").map_err(|e| self.write_error(e))?;
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// Encode a single CSV record, quoting fields as necessary.
fn encode_csv_row<V: AsRef<str>>(values: &[V]) -> Vec<u8> {
    let mut writer = csv_core::Writer::new();
    let mut line = Vec::new();
    let mut buffer = [0u8; 256];
    for (idx, value) in values.iter().enumerate() {
        if idx != 0 {
            drain(&mut line, &mut buffer, |out| writer.delimiter(out));
        }
        let mut input = value.as_ref().as_bytes();
        loop {
            let (result, read, written) = writer.field(input, &mut buffer);
            line.extend_from_slice(&buffer[..written]);
            input = &input[read..];
            if let WriteResult::InputEmpty = result {
                break;
            }
        }
    }
    drain(&mut line, &mut buffer, |out| writer.terminator(out));
    line
}

fn drain(
    line: &mut Vec<u8>,
    buffer: &mut [u8],
    mut step: impl FnMut(&mut [u8]) -> (WriteResult, usize),
) {
    loop {
        let (result, written) = step(buffer);
        line.extend_from_slice(&buffer[..written]);
        if let WriteResult::InputEmpty = result {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::encode_csv_row;

    #[test]
    fn csv_quoting() {
        assert_eq!(encode_csv_row(&["a", "b c"]), b"a,b c\n");
        assert_eq!(encode_csv_row(&["x,y", "say \"hi\""]), b"\"x,y\",\"say \"\"hi\"\"\"\n");
        let long = "z".repeat(1000);
        assert_eq!(encode_csv_row(&[long.as_str()]).len(), 1001);
    }
}
