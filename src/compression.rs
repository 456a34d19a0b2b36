use crate::config::Compressor;
use crate::error::Error;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{Read, Write};

// The compressor never emits the trailing empty block on the wire; the
// decompressor feeds it back before inflating (RFC 7692 §7.2.1).
const DEFLATE_TRAILER: [u8; 4] = [0, 0, 255, 255];

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096 // 4 KB for small payloads
    } else if payload_size <= 65536 {
        16384 // 16 KB for medium payloads
    } else {
        65536 // 64 KB for large payloads
    }
}

/// Compressing half of a permessage-deflate direction.
pub struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let compressor = match window_bits {
            Some(bits) => Compress::new_with_window_bits(Compression::default(), false, bits),
            None => Compress::new(Compression::default(), false),
        };
        Self {
            compressor,
            reset_context,
        }
    }

    /// Compresses one message and strips the `00 00 ff ff` tail so only the
    /// meaningful deflate output travels in the frame.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if self.reset_context {
            self.compressor.reset();
        }

        let before_in = self.compressor.total_in();
        let mut compressed = Vec::with_capacity(calculate_buffer_size(payload.len()));

        while (self.compressor.total_in() - before_in) < payload.len() as u64 {
            let consumed = (self.compressor.total_in() - before_in) as usize;
            self.compressor
                .compress_vec(&payload[consumed..], &mut compressed, FlushCompress::None)
                .map_err(|e| Error::DeflateFailed(e.to_string()))?;
            if compressed.len() == compressed.capacity() {
                compressed.reserve(calculate_buffer_size(payload.len()));
            }
        }
        // Flush the sync block so the message is self-contained, then drop
        // the four trailer bytes
        loop {
            let before_out = self.compressor.total_out();
            self.compressor
                .compress_vec(&[], &mut compressed, FlushCompress::Sync)
                .map_err(|e| Error::DeflateFailed(e.to_string()))?;
            if self.compressor.total_out() == before_out {
                break;
            }
            if compressed.len() == compressed.capacity() {
                compressed.reserve(4096);
            } else {
                break;
            }
        }

        if compressed.ends_with(&DEFLATE_TRAILER) {
            compressed.truncate(compressed.len() - DEFLATE_TRAILER.len());
        }
        Ok(compressed)
    }
}

/// Decompressing half of a permessage-deflate direction.
pub struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let decompressor = match window_bits {
            Some(bits) => Decompress::new_with_window_bits(false, bits),
            None => Decompress::new(false),
        };
        Self {
            decompressor,
            reset_context,
        }
    }

    /// Inflates one message, re-appending the empty-block trailer the sender
    /// stripped. `limit` bounds the inflated size.
    pub fn decompress(&mut self, payload: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        // Reset the decompressor before starting to ensure no leftover state
        if self.reset_context {
            self.decompressor.reset(false);
        }

        let before_in = self.decompressor.total_in();
        let buffer_size = calculate_buffer_size(payload.len());
        let mut decompressed: Vec<u8> = Vec::with_capacity(buffer_size);

        // When contexts are kept across messages the counters keep growing,
        // so consumption is tracked relative to where this message started.
        while (self.decompressor.total_in() - before_in) < input.len() as u64 {
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            match self
                .decompressor
                .decompress_vec(&input[consumed..], &mut decompressed, FlushDecompress::Sync)
                .map_err(|e| Error::InflateFailed(e.to_string()))?
            {
                Status::StreamEnd => break,
                _ => {
                    if decompressed.len() > limit {
                        return Err(Error::WsProtocol(
                            crate::ws::frame::CloseCode::MessageTooBig,
                            "inflated message above the configured maximum",
                        ));
                    }
                    if decompressed.len() == decompressed.capacity() {
                        decompressed.reserve(buffer_size);
                    }
                }
            }
        }

        Ok(decompressed)
    }
}

/// Both halves of this peer's permessage-deflate machinery, built from the
/// negotiated extension parameters.
pub struct MessageDeflate {
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl MessageDeflate {
    /// `is_client` decides which negotiated direction maps onto which half:
    /// a client compresses on the client-to-server parameters and
    /// decompresses on the server-to-client ones, a server the other way
    /// around. Negotiated 8-bit windows become 9: zlib cannot produce raw
    /// deflate with an 8-bit window, and 9 stays wire-compatible.
    pub fn new(extensions: &crate::ws::extensions::Extensions, is_client: bool) -> Self {
        fn clamp(bits: Option<u8>) -> Option<u8> {
            bits.map(|bits| bits.max(9))
        }
        let client_reset = extensions.client_no_context_takeover.unwrap_or(false);
        let server_reset = extensions.server_no_context_takeover.unwrap_or(false);
        let (enc_reset, enc_bits, dec_reset, dec_bits) = if is_client {
            (
                client_reset,
                extensions.client_max_window_bits,
                server_reset,
                extensions.server_max_window_bits,
            )
        } else {
            (
                server_reset,
                extensions.server_max_window_bits,
                client_reset,
                extensions.client_max_window_bits,
            )
        };
        MessageDeflate {
            encoder: Encoder::new(enc_reset, clamp(enc_bits)),
            decoder: Decoder::new(dec_reset, clamp(dec_bits)),
        }
    }
}

/// One-shot HTTP body coding, selected by Content-Encoding.
pub fn encode_body(compressor: Compressor, body: &[u8]) -> Result<Vec<u8>, Error> {
    match compressor {
        Compressor::None => Ok(body.to_vec()),
        Compressor::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        Compressor::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        Compressor::Brotli => {
            let mut out = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(body)?;
            drop(writer);
            Ok(out)
        }
    }
}

pub fn decode_body(compressor: Compressor, body: &[u8]) -> Result<Vec<u8>, Error> {
    match compressor {
        Compressor::None => Ok(body.to_vec()),
        Compressor::Deflate => {
            let mut decoder = flate2::read::ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InflateFailed(e.to_string()))?;
            Ok(out)
        }
        Compressor::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InflateFailed(e.to_string()))?;
            Ok(out)
        }
        Compressor::Brotli => {
            let mut decoder = brotli::Decompressor::new(body, 4096);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::InflateFailed(e.to_string()))?;
            Ok(out)
        }
    }
}
