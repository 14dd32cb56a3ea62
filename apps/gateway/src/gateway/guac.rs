//! Guacamole wire protocol: instruction framing, the guacd handshake and a
//! streaming reader.
//!
//! Instructions are length-prefixed, dot-separated elements joined by commas
//! and terminated by a semicolon (`4.sync,8.12345678;`). Element lengths
//! count characters, not bytes.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Opcode reserved for tunnel-internal messages. Instructions carrying it
/// are never forwarded in either direction.
pub const INTERNAL_DATA_OPCODE: &str = "";

/// Wire prefix of an internal instruction: the length-prefixed empty opcode.
pub const INTERNAL_OPCODE_PREFIX: &[u8] = b"0.";

/// Flush threshold for the outbound WebSocket buffer.
pub const MAX_GUAC_MESSAGE: usize = 8192;

/// Read buffer size for the raw socket.
const READ_CHUNK: usize = 8192;

/// Protocol version announced when guacd predates versioned handshakes.
const FALLBACK_VERSION: &str = "VERSION_1_1_0";

#[derive(Debug)]
pub enum GuacError {
    Io(std::io::Error),
    /// The peer closed the connection.
    Eof,
    Protocol(String),
}

impl fmt::Display for GuacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuacError::Io(e) => write!(f, "io error: {e}"),
            GuacError::Eof => write!(f, "EOF"),
            GuacError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for GuacError {}

impl From<std::io::Error> for GuacError {
    fn from(e: std::io::Error) -> Self {
        GuacError::Io(e)
    }
}

/// A single decoded Guacamole instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_element(&mut out, &self.opcode);
        for arg in &self.args {
            out.push(',');
            push_element(&mut out, arg);
        }
        out.push(';');
        out
    }

    pub fn parse(raw: &str) -> Result<Self, GuacError> {
        let mut elements = Vec::new();
        let mut pos = 0;
        loop {
            let dot = raw[pos..]
                .find('.')
                .map(|d| pos + d)
                .ok_or_else(|| GuacError::Protocol("missing length separator".to_string()))?;
            let len: usize = raw[pos..dot]
                .parse()
                .map_err(|_| GuacError::Protocol("invalid element length".to_string()))?;

            let value_start = dot + 1;
            let (term_off, term) = raw[value_start..]
                .char_indices()
                .nth(len)
                .ok_or_else(|| GuacError::Protocol("truncated instruction".to_string()))?;
            let term_pos = value_start + term_off;
            elements.push(raw[value_start..term_pos].to_string());

            match term {
                ',' => pos = term_pos + 1,
                ';' => break,
                _ => {
                    return Err(GuacError::Protocol(format!(
                        "unexpected element terminator {term:?}"
                    )))
                }
            }
        }

        let mut iter = elements.into_iter();
        let opcode = iter
            .next()
            .ok_or_else(|| GuacError::Protocol("empty instruction".to_string()))?;
        Ok(Self {
            opcode,
            args: iter.collect(),
        })
    }
}

fn push_element(out: &mut String, value: &str) {
    use fmt::Write as _;
    let _ = write!(out, "{}.{}", value.chars().count(), value);
}

/// Connection settings negotiated with guacd.
#[derive(Debug, Clone, Default)]
pub struct GuacConfig {
    pub protocol: String,
    pub parameters: HashMap<String, String>,
    pub image_mimetypes: Vec<String>,
    pub audio_mimetypes: Vec<String>,
    pub video_mimetypes: Vec<String>,
    pub optimal_width: u32,
    pub optimal_height: u32,
    pub optimal_resolution: u32,
}

impl GuacConfig {
    /// Settings for the VNC server running inside the pod. `quality` maps to
    /// the color depth: 8 is visibly banded, 16 is fine for most data, 24 is
    /// good even for pictures.
    pub fn vnc(quality: &str) -> Self {
        let color_depth = match quality {
            "low" => "8",
            "medium" => "16",
            _ => "24",
        };

        let mut parameters = HashMap::new();
        parameters.insert("hostname".to_string(), "127.0.0.1".to_string());
        parameters.insert("port".to_string(), "5910".to_string());
        parameters.insert("cursor".to_string(), "local".to_string());
        parameters.insert("autoretry".to_string(), "true".to_string());
        parameters.insert("color-depth".to_string(), color_depth.to_string());

        Self {
            protocol: "vnc".to_string(),
            parameters,
            // With all types offered, guacd picks a compression dynamically
            // based on how fast elements are updated.
            image_mimetypes: vec![
                "image/webp".to_string(),
                "image/jpeg".to_string(),
                "image/png".to_string(),
            ],
            audio_mimetypes: vec![
                "audio/L16".to_string(),
                "rate=44100".to_string(),
                "channels=2".to_string(),
            ],
            video_mimetypes: Vec::new(),
            optimal_width: 1024,
            optimal_height: 768,
            optimal_resolution: 96,
        }
    }
}

/// A framed stream over a guacd connection.
pub struct GuacStream<S> {
    reader: GuacReader<S>,
    writer: GuacWriter<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> GuacStream<S> {
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: GuacReader {
                inner: read,
                buffer: Vec::new(),
            },
            writer: GuacWriter { inner: write },
        }
    }

    /// Run the client side of the guacd handshake; returns the connection id
    /// from the `ready` instruction.
    pub async fn handshake(
        &mut self,
        config: &GuacConfig,
        read_timeout: Duration,
    ) -> Result<String, GuacError> {
        self.writer
            .write_instruction(&Instruction::new("select", vec![config.protocol.clone()]))
            .await?;

        let args = self.read_instruction(read_timeout).await?;
        if args.opcode != "args" {
            return Err(GuacError::Protocol(format!(
                "expected args instruction, got {:?}",
                args.opcode
            )));
        }

        self.writer
            .write_instruction(&Instruction::new(
                "size",
                vec![
                    config.optimal_width.to_string(),
                    config.optimal_height.to_string(),
                    config.optimal_resolution.to_string(),
                ],
            ))
            .await?;
        self.writer
            .write_instruction(&Instruction::new("audio", config.audio_mimetypes.clone()))
            .await?;
        self.writer
            .write_instruction(&Instruction::new("video", config.video_mimetypes.clone()))
            .await?;
        self.writer
            .write_instruction(&Instruction::new("image", config.image_mimetypes.clone()))
            .await?;

        // guacd announces the accepted parameter names; answer each with the
        // configured value or an empty element. The first element carries the
        // protocol version since 1.1.0.
        let version = match args.args.first() {
            Some(v) if v.starts_with("VERSION") => v.clone(),
            _ => FALLBACK_VERSION.to_string(),
        };
        let mut connect_args = vec![version];
        for name in args.args.iter().skip(1) {
            connect_args.push(config.parameters.get(name).cloned().unwrap_or_default());
        }
        self.writer
            .write_instruction(&Instruction::new("connect", connect_args))
            .await?;

        let ready = self.read_instruction(read_timeout).await?;
        if ready.opcode != "ready" {
            return Err(GuacError::Protocol(format!(
                "expected ready instruction, got {:?}",
                ready.opcode
            )));
        }
        ready
            .args
            .first()
            .cloned()
            .ok_or_else(|| GuacError::Protocol("ready instruction without id".to_string()))
    }

    /// Read and decode the next instruction, bounded by `read_timeout`.
    pub async fn read_instruction(
        &mut self,
        read_timeout: Duration,
    ) -> Result<Instruction, GuacError> {
        let raw = tokio::time::timeout(read_timeout, self.reader.read_some())
            .await
            .map_err(|_| GuacError::Protocol("handshake read timed out".to_string()))??;
        let text = std::str::from_utf8(&raw)
            .map_err(|_| GuacError::Protocol("instruction is not valid UTF-8".to_string()))?;
        Instruction::parse(text)
    }

    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<(), GuacError> {
        self.writer.write_instruction(instruction).await
    }

    pub fn split(self) -> (GuacReader<S>, GuacWriter<S>) {
        (self.reader, self.writer)
    }
}

/// Read half: yields one complete instruction at a time.
pub struct GuacReader<S> {
    inner: ReadHalf<S>,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite> GuacReader<S> {
    /// Read the next complete instruction (raw bytes, terminator included).
    pub async fn read_some(&mut self) -> Result<Vec<u8>, GuacError>
    where
        S: Unpin,
    {
        loop {
            if let Some(end) = frame_end(&self.buffer)? {
                let rest = self.buffer.split_off(end);
                let instruction = std::mem::replace(&mut self.buffer, rest);
                return Ok(instruction);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(GuacError::Eof);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether another instruction (or part of one) is already buffered.
    pub fn available(&self) -> bool {
        !self.buffer.is_empty()
    }
}

/// Write half.
pub struct GuacWriter<S> {
    inner: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> GuacWriter<S> {
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), GuacError> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<(), GuacError> {
        self.write_raw(instruction.encode().as_bytes()).await
    }
}

/// Find the byte length of the first complete instruction in `buffer`, or
/// `None` when more data is needed.
fn frame_end(buffer: &[u8]) -> Result<Option<usize>, GuacError> {
    let valid = match std::str::from_utf8(buffer) {
        Ok(s) => s,
        // A partial multi-byte character at the tail is expected mid-stream.
        Err(e) => std::str::from_utf8(&buffer[..e.valid_up_to()]).expect("validated prefix"),
    };

    let mut pos = 0;
    loop {
        let dot = match valid[pos..].find('.') {
            Some(d) => pos + d,
            None => {
                if valid.len() - pos > 10 {
                    return Err(GuacError::Protocol("missing length separator".to_string()));
                }
                return Ok(None);
            }
        };
        let len: usize = valid[pos..dot]
            .parse()
            .map_err(|_| GuacError::Protocol("invalid element length".to_string()))?;

        let value_start = dot + 1;
        let (term_off, term) = match valid[value_start..].char_indices().nth(len) {
            Some(found) => found,
            None => return Ok(None),
        };
        let term_pos = value_start + term_off;

        match term {
            ',' => pos = term_pos + 1,
            ';' => return Ok(Some(term_pos + term.len_utf8())),
            _ => {
                return Err(GuacError::Protocol(format!(
                    "unexpected element terminator {term:?}"
                )))
            }
        }
    }
}
