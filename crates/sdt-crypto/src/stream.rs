//! Streaming encoder/decoder over `Read` sources.
//!
//! Both sides are lazy: each `next()` pulls exactly one block from the
//! underlying source. Neither can rewind; to re-read, seek the source to
//! `layout.plaintext_offset(i)` (encoder) or `layout.block_offset(i)`
//! (decoder) and open a new block iterator at `i`.

use std::io::Read;
use std::ops::Range;

use tracing::debug;

use crate::block::{decrypt_block, encrypt_block, CipherBlock};
use crate::error::CodecError;
use crate::header::Header;
use crate::keys::{generate_data_key, seal_key, unseal_key, DataKey, Identity, Recipient};
use crate::layout::ContainerLayout;
use crate::MAGIC;

/// Encrypting side of one container.
pub struct Encoder {
    key: DataKey,
    header: Header,
    layout: ContainerLayout,
}

impl Encoder {
    /// Start a new container: fresh data key sealed to `recipients`.
    pub fn new(recipients: &[Recipient], plaintext_len: u64) -> Result<Self, CodecError> {
        let key = generate_data_key();
        let sealed_key = seal_key(&key, recipients)?;
        let header = Header {
            plaintext_len,
            sealed_key,
        };
        let layout = ContainerLayout::checked(header.encoded_len(), plaintext_len)?;
        debug!(
            recipients = recipients.len(),
            plaintext_len,
            blocks = layout.block_count(),
            "opened encoder"
        );
        Ok(Self {
            key,
            header,
            layout,
        })
    }

    /// Reopen an existing container for re-encoding, given its data key and
    /// header bytes. Blocks produced match the original byte for byte.
    pub fn resume(key: DataKey, header_bytes: &[u8]) -> Result<Self, CodecError> {
        let header = Header::from_bytes(header_bytes)?;
        let layout = ContainerLayout::checked(header.encoded_len(), header.plaintext_len)?;
        Ok(Self {
            key,
            header,
            layout,
        })
    }

    pub fn header_bytes(&self) -> Vec<u8> {
        self.header.to_bytes()
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    pub fn data_key(&self) -> &DataKey {
        &self.key
    }

    /// Blocks `first..end` read from `source`, which must be positioned at
    /// `layout.plaintext_offset(first)`.
    pub fn blocks<R: Read>(&self, source: R, blocks: Range<u64>) -> BlockEncoder<'_, R> {
        let end = blocks.end.min(self.layout.block_count());
        BlockEncoder {
            encoder: self,
            source,
            next: blocks.start,
            end,
            buf: Vec::new(),
        }
    }

    /// Encode a run of blocks into one contiguous buffer (wire bytes).
    pub fn encode_range<R: Read>(
        &self,
        source: R,
        blocks: Range<u64>,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        for block in self.blocks(source, blocks) {
            out.extend_from_slice(&block?.data);
        }
        Ok(out)
    }
}

/// Lazy iterator of `CipherBlock`s.
pub struct BlockEncoder<'a, R> {
    encoder: &'a Encoder,
    source: R,
    next: u64,
    end: u64,
    buf: Vec<u8>,
}

impl<R: Read> Iterator for BlockEncoder<'_, R> {
    type Item = Result<CipherBlock, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(self.encode_one(index))
    }
}

impl<R: Read> BlockEncoder<'_, R> {
    fn encode_one(&mut self, index: u64) -> Result<CipherBlock, CodecError> {
        let layout = &self.encoder.layout;
        let len = layout.block_plain_len(index) as usize;
        self.buf.resize(len, 0);
        self.source.read_exact(&mut self.buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended before block {index}; file shrank while encoding"),
            )),
            _ => CodecError::Io(e),
        })?;

        let is_final = layout.is_final(index);
        if is_final {
            let mut probe = [0u8; 1];
            if self.source.read(&mut probe)? != 0 {
                return Err(CodecError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "source grew past its declared length while encoding",
                )));
            }
        }

        encrypt_block(
            &self.encoder.key,
            index,
            is_final,
            layout.plaintext_len,
            &self.buf,
        )
    }
}

/// Decrypting side of one container. Enforces contiguous block order.
pub struct Decoder {
    key: DataKey,
    layout: ContainerLayout,
    next: u64,
}

impl Decoder {
    /// Read the header from `source` and unseal the data key.
    pub fn open<R: Read>(identities: &[Identity], source: &mut R) -> Result<Self, CodecError> {
        let header = Header::read_from(source)?;
        Self::with_header(identities, header)
    }

    /// Unseal from header bytes obtained separately (e.g. by a range read).
    pub fn from_header_bytes(
        identities: &[Identity],
        header_bytes: &[u8],
    ) -> Result<Self, CodecError> {
        Self::with_header(identities, Header::from_bytes(header_bytes)?)
    }

    fn with_header(identities: &[Identity], header: Header) -> Result<Self, CodecError> {
        let layout = ContainerLayout::checked(header.encoded_len(), header.plaintext_len)?;
        let key = unseal_key(&header.sealed_key, identities)?;
        Ok(Self {
            key,
            layout,
            next: 0,
        })
    }

    pub fn layout(&self) -> &ContainerLayout {
        &self.layout
    }

    /// Index of the next block this decoder expects.
    pub fn next_block(&self) -> u64 {
        self.next
    }

    /// Continue at a block boundary; only valid when everything before
    /// `index` has already been verified and committed by the caller.
    pub fn seek_block(&mut self, index: u64) {
        self.next = index.min(self.layout.block_count());
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.layout.block_count()
    }

    /// Decrypt a run of whole blocks starting at `next_block()`.
    ///
    /// All-or-nothing: if any block in the run fails, no plaintext from the
    /// run is returned and the decoder does not advance.
    pub fn decrypt_run(&mut self, wire: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut index = self.next;
        let mut offset = 0usize;
        let mut plaintext = Vec::with_capacity(wire.len());

        while offset < wire.len() {
            if index >= self.layout.block_count() {
                return Err(CodecError::Integrity(format!(
                    "{} trailing bytes after final block",
                    wire.len() - offset
                )));
            }
            let len = self.layout.block_cipher_len(index) as usize;
            if wire.len() - offset < len {
                return Err(CodecError::Integrity(format!(
                    "block {index} truncated: {} of {len} bytes",
                    wire.len() - offset
                )));
            }
            let block = &wire[offset..offset + len];
            plaintext.extend_from_slice(&decrypt_block(
                &self.key,
                index,
                self.layout.is_final(index),
                self.layout.plaintext_len,
                block,
            )?);
            offset += len;
            index += 1;
        }

        self.next = index;
        Ok(plaintext)
    }

    /// Confirm the stream ended exactly at the final block.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(CodecError::Integrity(format!(
                "stream truncated: {} of {} blocks",
                self.next,
                self.layout.block_count()
            )))
        }
    }

    /// Lazy plaintext iterator over the remaining blocks of `source`, which
    /// must be positioned at `layout.block_offset(next_block())`.
    pub fn plaintext<R: Read>(self, source: R) -> PlaintextBlocks<R> {
        PlaintextBlocks {
            decoder: self,
            source,
            failed: false,
        }
    }
}

/// Iterator of verified plaintext windows, one per block. Stops after the
/// first error.
pub struct PlaintextBlocks<R> {
    decoder: Decoder,
    source: R,
    failed: bool,
}

impl<R: Read> Iterator for PlaintextBlocks<R> {
    type Item = Result<Vec<u8>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_block();
        match result {
            Ok(None) => None,
            Ok(Some(pt)) => Some(Ok(pt)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> PlaintextBlocks<R> {
    fn next_block(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.decoder.is_complete() {
            let mut probe = [0u8; 1];
            if self.source.read(&mut probe)? != 0 {
                return Err(CodecError::Integrity("trailing bytes after final block".into()));
            }
            return Ok(None);
        }

        let index = self.decoder.next;
        let len = self.decoder.layout.block_cipher_len(index) as usize;
        let mut wire = vec![0u8; len];
        self.source.read_exact(&mut wire).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CodecError::Integrity(format!("stream truncated inside block {index}"))
            }
            _ => CodecError::Io(e),
        })?;
        self.decoder.decrypt_run(&wire).map(Some)
    }
}

/// Encrypt an in-memory buffer into a complete container.
pub fn encrypt_to_vec(recipients: &[Recipient], plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let encoder = Encoder::new(recipients, plaintext.len() as u64)?;
    let mut out = encoder.header_bytes();
    let blocks = 0..encoder.layout().block_count();
    out.extend_from_slice(&encoder.encode_range(plaintext, blocks)?);
    Ok(out)
}

/// Decrypt a complete container. Returns nothing unless every block verifies.
pub fn decrypt_to_vec(identities: &[Identity], container: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut source = container;
    let decoder = Decoder::open(identities, &mut source)?;
    // the declared length is untrusted until the blocks verify
    let mut plaintext = Vec::with_capacity(container.len());
    for block in decoder.plaintext(source) {
        plaintext.extend_from_slice(&block?);
    }
    Ok(plaintext)
}

/// Whether `prefix` starts with the container magic.
pub fn is_container(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && &prefix[..MAGIC.len()] == MAGIC
}
