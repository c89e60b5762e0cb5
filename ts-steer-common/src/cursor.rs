//! Bounds-checked forward cursor over a packet buffer.
//!
//! Every read first checks that the bytes it needs lie before the end
//! boundary. The cursor never moves backwards and never past the end.

/// Parse-time failure. Both variants make the decision engine pass the
/// packet through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer bytes remain than the header being parsed needs.
    InsufficientData,
    /// A length field in the header is internally inconsistent.
    MalformedHeader,
}

/// A readable packet window.
///
/// Implemented for byte slices here and for the XDP packet window in the
/// eBPF program, so the same parsers run in both places.
pub trait PacketBytes {
    /// Total length of the packet window in bytes.
    fn len(&self) -> usize;

    /// Copy `N` bytes starting at `offset`, or `None` if any of them lies
    /// outside the window.
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PacketBytes for [u8] {
    #[inline(always)]
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        let bytes = self.get(offset..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }
}

/// Incremental position tracker used while parsing nested headers.
pub struct HeaderCursor<'p, P: PacketBytes + ?Sized> {
    packet: &'p P,
    pos: usize,
}

impl<'p, P: PacketBytes + ?Sized> HeaderCursor<'p, P> {
    /// Start a cursor at the first byte of `packet`.
    #[inline(always)]
    pub fn new(packet: &'p P) -> Self {
        Self { packet, pos: 0 }
    }

    /// Current offset from the start of the packet.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left between the cursor and the end boundary.
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.packet.len().saturating_sub(self.pos)
    }

    /// Read `N` bytes at the cursor without advancing.
    #[inline(always)]
    pub fn peek<const N: usize>(&self) -> Result<[u8; N], ParseError> {
        if self.remaining() < N {
            return Err(ParseError::InsufficientData);
        }
        self.packet
            .load::<N>(self.pos)
            .ok_or(ParseError::InsufficientData)
    }

    /// Read `N` bytes at the cursor and advance past them.
    #[inline(always)]
    pub fn take<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let bytes = self.peek::<N>()?;
        self.pos += N;
        Ok(bytes)
    }

    /// Advance `n` bytes without reading them.
    #[inline(always)]
    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        if self.remaining() < n {
            return Err(ParseError::InsufficientData);
        }
        self.pos += n;
        Ok(())
    }
}
