//! Line-framed wire codec for the matrix protocol.
//!
//! Every line ends with `\r\n`. Integers are ASCII decimal with an optional
//! leading `-`, separated by single spaces. There is exactly one spelling per
//! value: no `+` sign, no leading zeros and no `-0`.
//!
//! ```text
//! C: HELLO\r\n
//! S: CONNECTED\r\n
//! C: <n>\r\n
//! C: <n rows of matrix A, n values each>
//! C: <n rows of matrix B, n values each>
//! C: <workers>\r\n
//! S: <n>\r\n
//! S: <n rows of A + B>
//! ```
//!
//! On failure the server may send `ERROR <kind>: <reason>\r\n` and close.
//!
//! Decoders are incremental: they are fed the whole receive buffer each
//! time more bytes arrive and return `Ok(None)` until a full message is
//! present. Nothing in the payload is ever interpreted beyond integer parsing.

use crate::error::ProtocolError;
use crate::matrix::Matrix;
use bytes::BytesMut;
use std::fmt::Write;

/// Handshake token sent by the client.
pub const HANDSHAKE: &str = "HELLO";

/// Acknowledgment token sent by the server.
pub const ACK: &str = "CONNECTED";

/// Prefix of a best-effort failure reply.
pub const ERROR_PREFIX: &str = "ERROR ";

/// Longest handshake/ack line accepted before giving up on finding `\r\n`.
const MAX_TOKEN_LINE: usize = 64;

/// Longest offending token echoed back in an error.
const MAX_ECHOED_TOKEN: usize = 32;

/// A decoded addition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub a: Matrix,
    pub b: Matrix,
    /// Requested worker count, validated later by the chunk planner.
    pub workers: i64,
}

/// Tracks the read position across incremental decode calls.
#[derive(Debug, Default)]
struct LineCursor {
    pos: usize,
    line: usize,
}

impl LineCursor {
    /// Next complete line of `input` after the cursor, without its `\r\n`.
    fn next_line<'a>(&mut self, input: &'a [u8]) -> Result<Option<&'a str>, ProtocolError> {
        let rest = &input[self.pos..];
        let Some(end) = find_crlf(rest) else {
            return Ok(None);
        };
        self.line += 1;
        let line =
            std::str::from_utf8(&rest[..end]).map_err(|_| ProtocolError::MalformedLine(self.line))?;
        self.pos += end + 2;
        Ok(Some(line))
    }
}

/// Check the client's handshake line.
///
/// Returns the number of bytes consumed once a full line is present.
pub fn parse_handshake(input: &[u8]) -> Result<Option<usize>, ProtocolError> {
    parse_token_line(input, HANDSHAKE)
}

/// Check the server's acknowledgment line.
pub fn parse_ack(input: &[u8]) -> Result<Option<usize>, ProtocolError> {
    parse_token_line(input, ACK)
}

fn parse_token_line(input: &[u8], token: &str) -> Result<Option<usize>, ProtocolError> {
    let Some(end) = find_crlf(input) else {
        if input.len() > MAX_TOKEN_LINE {
            return Err(ProtocolError::BadHandshake(echo_token(
                &String::from_utf8_lossy(input),
            )));
        }
        return Ok(None);
    };

    let line = &input[..end];
    if line == token.as_bytes() {
        return Ok(Some(end + 2));
    }

    let line = String::from_utf8_lossy(line);
    if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
        return Err(ProtocolError::ErrorReply(reason.to_string()));
    }
    Err(ProtocolError::BadHandshake(echo_token(&line)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStage {
    Dimension,
    MatrixA,
    MatrixB,
    Workers,
    Done,
}

/// Incremental decoder for the request payload.
#[derive(Debug)]
pub struct RequestDecoder {
    max_dim: usize,
    cursor: LineCursor,
    stage: RequestStage,
    dim: usize,
    cells: usize,
    a: Vec<i64>,
    b: Vec<i64>,
}

impl RequestDecoder {
    pub fn new(max_dim: usize) -> Self {
        Self {
            max_dim,
            cursor: LineCursor::default(),
            stage: RequestStage::Dimension,
            dim: 0,
            cells: 0,
            a: Vec::new(),
            b: Vec::new(),
        }
    }

    /// Continue decoding from `input`, which must start with the first
    /// payload byte and only ever grow between calls.
    pub fn decode(&mut self, input: &[u8]) -> Result<Option<Request>, ProtocolError> {
        while let Some(line) = self.cursor.next_line(input)? {
            let line_no = self.cursor.line;
            match self.stage {
                RequestStage::Dimension => {
                    // Buffers grow row by row; the dimension line alone
                    // must not commit memory.
                    (self.dim, self.cells) = parse_dimension(line, self.max_dim)?;
                    self.stage = RequestStage::MatrixA;
                }
                RequestStage::MatrixA => {
                    parse_row(line, line_no, self.dim, &mut self.a)?;
                    if self.a.len() == self.cells {
                        self.stage = RequestStage::MatrixB;
                    }
                }
                RequestStage::MatrixB => {
                    parse_row(line, line_no, self.dim, &mut self.b)?;
                    if self.b.len() == self.cells {
                        self.stage = RequestStage::Workers;
                    }
                }
                RequestStage::Workers => {
                    let workers = parse_int(line, line_no)?;
                    if self.cursor.pos != input.len() {
                        return Err(ProtocolError::TrailingData);
                    }
                    self.stage = RequestStage::Done;
                    let dim = self.dim;
                    let a = Matrix::from_row_major(dim, std::mem::take(&mut self.a))
                        .ok_or_else(|| ProtocolError::InvalidDimension(dim.to_string()))?;
                    let b = Matrix::from_row_major(dim, std::mem::take(&mut self.b))
                        .ok_or_else(|| ProtocolError::InvalidDimension(dim.to_string()))?;
                    return Ok(Some(Request { a, b, workers }));
                }
                RequestStage::Done => return Err(ProtocolError::TrailingData),
            }
        }
        Ok(None)
    }
}

/// Decode a complete request payload in one go.
pub fn decode(input: &[u8], max_dim: usize) -> Result<Request, ProtocolError> {
    RequestDecoder::new(max_dim)
        .decode(input)?
        .ok_or(ProtocolError::UnexpectedEof)
}

/// Incremental decoder for the result the server sends back.
#[derive(Debug)]
pub struct ResultDecoder {
    max_dim: usize,
    cursor: LineCursor,
    dim: Option<(usize, usize)>,
    data: Vec<i64>,
}

impl ResultDecoder {
    pub fn new(max_dim: usize) -> Self {
        Self {
            max_dim,
            cursor: LineCursor::default(),
            dim: None,
            data: Vec::new(),
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> Result<Option<Matrix>, ProtocolError> {
        while let Some(line) = self.cursor.next_line(input)? {
            let line_no = self.cursor.line;
            match self.dim {
                None => {
                    if let Some(reason) = line.strip_prefix(ERROR_PREFIX) {
                        return Err(ProtocolError::ErrorReply(reason.to_string()));
                    }
                    self.dim = Some(parse_dimension(line, self.max_dim)?);
                }
                Some((dim, _)) => parse_row(line, line_no, dim, &mut self.data)?,
            }
            if let Some((dim, cells)) = self.dim {
                if self.data.len() == cells {
                    return Matrix::from_row_major(dim, std::mem::take(&mut self.data))
                        .map(Some)
                        .ok_or_else(|| ProtocolError::InvalidDimension(dim.to_string()));
                }
            }
        }
        Ok(None)
    }
}

/// Encode a request payload (everything after the handshake).
pub fn encode_request(a: &Matrix, b: &Matrix, workers: i64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(estimate_len(a) * 2 + 16);
    write_dimension(&mut buf, a.dim());
    write_rows(&mut buf, a);
    write_rows(&mut buf, b);
    let _ = write!(buf, "{workers}\r\n");
    buf
}

/// Encode a result matrix.
pub fn encode_result(matrix: &Matrix) -> BytesMut {
    let mut buf = BytesMut::with_capacity(estimate_len(matrix) + 8);
    write_dimension(&mut buf, matrix.dim());
    write_rows(&mut buf, matrix);
    buf
}

/// Encode a handshake or ack line.
pub fn encode_token(token: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(token.len() + 2);
    buf.extend_from_slice(token.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Encode a best-effort failure reply. Line breaks in `reason` are flattened.
pub fn encode_error(kind: &str, reason: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ERROR_PREFIX.len() + kind.len() + reason.len() + 4);
    buf.extend_from_slice(ERROR_PREFIX.as_bytes());
    let _ = write!(buf, "{kind}: ");
    buf.extend_from_slice(reason.replace(['\r', '\n'], " ").as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf
}

fn write_dimension(buf: &mut BytesMut, dim: usize) {
    let _ = write!(buf, "{dim}\r\n");
}

fn write_rows(buf: &mut BytesMut, matrix: &Matrix) {
    for row in matrix.rows() {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b" ");
            }
            let _ = write!(buf, "{value}");
        }
        buf.extend_from_slice(b"\r\n");
    }
}

fn estimate_len(matrix: &Matrix) -> usize {
    // small values dominate in practice: a digit or two plus separator
    matrix.dim() * matrix.dim() * 3 + matrix.dim() * 2 + 8
}

/// Parse a dimension line, returning `(n, n * n)`.
fn parse_dimension(line: &str, max_dim: usize) -> Result<(usize, usize), ProtocolError> {
    if !is_canonical_int(line) || line.starts_with('-') || line == "0" {
        return Err(ProtocolError::InvalidDimension(echo_token(line)));
    }
    let dim: usize = line
        .parse()
        .map_err(|_| ProtocolError::InvalidDimension(echo_token(line)))?;
    if dim > max_dim {
        return Err(ProtocolError::DimensionTooLarge { dim, max: max_dim });
    }
    let cells = dim
        .checked_mul(dim)
        .ok_or(ProtocolError::DimensionTooLarge { dim, max: max_dim })?;
    Ok((dim, cells))
}

fn parse_int(token: &str, line: usize) -> Result<i64, ProtocolError> {
    let invalid = || ProtocolError::InvalidNumber {
        line,
        token: echo_token(token),
    };
    if !is_canonical_int(token) {
        return Err(invalid());
    }
    token.parse().map_err(|_| invalid())
}

/// `-?(0|[1-9][0-9]*)`, excluding `-0`.
fn is_canonical_int(token: &str) -> bool {
    let digits = token.strip_prefix('-').unwrap_or(token).as_bytes();
    match digits {
        [] => false,
        [b'0'] => digits.len() == token.len(),
        [b'0', ..] => false,
        _ => digits.iter().all(u8::is_ascii_digit),
    }
}

fn parse_row(line: &str, line_no: usize, dim: usize, out: &mut Vec<i64>) -> Result<(), ProtocolError> {
    let start = out.len();
    for token in line.split(' ') {
        if out.len() - start == dim {
            return Err(ProtocolError::RowLength {
                line: line_no,
                expected: dim,
                found: line.split(' ').count(),
            });
        }
        out.push(parse_int(token, line_no)?);
    }
    let found = out.len() - start;
    if found != dim {
        return Err(ProtocolError::RowLength {
            line: line_no,
            expected: dim,
            found,
        });
    }
    Ok(())
}

fn echo_token(token: &str) -> String {
    token.chars().take(MAX_ECHOED_TOKEN).collect()
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dim: usize, offset: i64) -> Matrix {
        let data = (0..(dim * dim) as i64).map(|v| v + offset).collect();
        Matrix::from_row_major(dim, data).unwrap()
    }

    #[test]
    fn test_parse_handshake() {
        assert_eq!(parse_handshake(b"HELLO\r\n"), Ok(Some(7)));
        assert_eq!(parse_handshake(b"HEL"), Ok(None));
        assert!(matches!(
            parse_handshake(b"GET / HTTP/1.1\r\n"),
            Err(ProtocolError::BadHandshake(_))
        ));
        assert!(matches!(
            parse_handshake(&[b'A'; 100]),
            Err(ProtocolError::BadHandshake(_))
        ));
    }

    #[test]
    fn test_parse_ack_error_reply() {
        assert_eq!(parse_ack(b"CONNECTED\r\n"), Ok(Some(11)));
        assert_eq!(
            parse_ack(b"ERROR protocol: nope\r\n"),
            Err(ProtocolError::ErrorReply("protocol: nope".to_string()))
        );
    }

    #[test]
    fn test_decode_request() {
        let input = b"2\r\n1 2\r\n3 4\r\n-5 6\r\n7 8\r\n3\r\n";
        let request = decode(input, 16).unwrap();
        assert_eq!(request.a.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(request.b.as_slice(), &[-5, 6, 7, 8]);
        assert_eq!(request.workers, 3);
    }

    #[test]
    fn test_decode_keeps_nonpositive_workers() {
        let request = decode(b"1\r\n1\r\n2\r\n-4\r\n", 16).unwrap();
        assert_eq!(request.workers, -4);
    }

    #[test]
    fn test_decode_incremental() {
        let input = b"2\r\n1 2\r\n3 4\r\n5 6\r\n7 8\r\n2\r\n";
        let mut decoder = RequestDecoder::new(16);
        for end in [1, 3, 6, 12, 20, input.len() - 1] {
            assert_eq!(decoder.decode(&input[..end]), Ok(None), "prefix {end}");
        }
        let request = decoder.decode(input).unwrap().unwrap();
        assert_eq!(request.workers, 2);
    }

    #[test]
    fn test_decode_non_numeric() {
        let err = decode(b"2\r\n1 2\r\n3 x\r\n", 16).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidNumber {
                line: 3,
                token: "x".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_expressions() {
        let err = decode(b"1\r\n__import__('os').system('id')\r\n", 16).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidNumber { line: 2, .. }));

        let err = decode(b"[[1]],[[2]],1\r\n", 16).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidDimension(_)));
    }

    #[test]
    fn test_decode_row_length() {
        let err = decode(b"2\r\n1 2 3\r\n", 16).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::RowLength {
                line: 2,
                expected: 2,
                found: 3
            }
        );

        let err = decode(b"2\r\n1 2\r\n3 4\r\n5\r\n", 16).unwrap_err();
        assert!(matches!(err, ProtocolError::RowLength { line: 4, found: 1, .. }));
    }

    #[test]
    fn test_decode_whitespace_is_strict() {
        assert!(decode(b"1\r\n 1\r\n1\r\n1\r\n", 16).is_err());
        assert!(decode(b"2\r\n1  2\r\n", 16).is_err());
        assert!(decode(b" 1\r\n", 16).is_err());
    }

    #[test]
    fn test_decode_dimension_limits() {
        assert!(matches!(
            decode(b"0\r\n", 16),
            Err(ProtocolError::InvalidDimension(_))
        ));
        assert!(matches!(
            decode(b"-3\r\n", 16),
            Err(ProtocolError::InvalidDimension(_))
        ));
        assert_eq!(
            decode(b"17\r\n", 16),
            Err(ProtocolError::DimensionTooLarge { dim: 17, max: 16 })
        );
    }

    #[test]
    fn test_decode_rejects_noncanonical_integers() {
        assert!(matches!(
            decode(b"+1\r\n5\r\n7\r\n2\r\n", 16),
            Err(ProtocolError::InvalidDimension(_))
        ));
        assert!(matches!(
            decode(b"01\r\n5\r\n7\r\n2\r\n", 16),
            Err(ProtocolError::InvalidDimension(_))
        ));
        assert_eq!(
            decode(b"1\r\n+5\r\n7\r\n2\r\n", 16),
            Err(ProtocolError::InvalidNumber { line: 2, token: "+5".to_string() })
        );
        assert_eq!(
            decode(b"1\r\n5\r\n007\r\n2\r\n", 16),
            Err(ProtocolError::InvalidNumber { line: 3, token: "007".to_string() })
        );
        assert_eq!(
            decode(b"1\r\n5\r\n-0\r\n2\r\n", 16),
            Err(ProtocolError::InvalidNumber { line: 3, token: "-0".to_string() })
        );
        assert_eq!(
            decode(b"1\r\n5\r\n7\r\n+2\r\n", 16),
            Err(ProtocolError::InvalidNumber { line: 4, token: "+2".to_string() })
        );
        assert_eq!(
            decode(b"1\r\n-\r\n", 16),
            Err(ProtocolError::InvalidNumber { line: 2, token: "-".to_string() })
        );

        let request = decode(b"1\r\n0\r\n-10\r\n2\r\n", 16).unwrap();
        assert_eq!(request.a.as_slice(), &[0]);
        assert_eq!(request.b.as_slice(), &[-10]);
    }

    #[test]
    fn test_dimension_line_does_not_reserve_operands() {
        let mut decoder = RequestDecoder::new(1024);
        assert_eq!(decoder.decode(b"1024\r\n"), Ok(None));
        assert!(decoder.a.capacity() < 1024 * 1024);
        assert!(decoder.b.capacity() < 1024 * 1024);

        let mut decoder = ResultDecoder::new(1024);
        assert_eq!(decoder.decode(b"1024\r\n"), Ok(None));
        assert!(decoder.data.capacity() < 1024 * 1024);
    }

    #[test]
    fn test_dimension_square_overflow_rejected() {
        let line = usize::MAX.to_string();
        assert_eq!(
            parse_dimension(&line, usize::MAX),
            Err(ProtocolError::DimensionTooLarge { dim: usize::MAX, max: usize::MAX })
        );
    }

    #[test]
    fn test_decode_trailing_data() {
        assert_eq!(
            decode(b"1\r\n1\r\n2\r\n1\r\nextra", 16),
            Err(ProtocolError::TrailingData)
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(
            decode(b"2\r\n1 2\r\n", 16),
            Err(ProtocolError::UnexpectedEof)
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert_eq!(
            decode(b"1\r\n\xff\r\n", 16),
            Err(ProtocolError::MalformedLine(2))
        );
    }

    #[test]
    fn test_encode_request_wire_format() {
        let a = Matrix::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap();
        let b = Matrix::from_rows(vec![vec![5, -6], vec![7, 8]]).unwrap();
        let encoded = encode_request(&a, &b, 2);
        assert_eq!(&encoded[..], b"2\r\n1 2\r\n3 4\r\n5 -6\r\n7 8\r\n2\r\n");
    }

    #[test]
    fn test_request_round_trip() {
        let a = sample(5, -12);
        let b = sample(5, i64::MAX - 30);
        let encoded = encode_request(&a, &b, 4);
        let request = decode(&encoded, 16).unwrap();
        assert_eq!(request, Request { a, b, workers: 4 });
        assert_eq!(encode_request(&request.a, &request.b, request.workers), encoded);
    }

    #[test]
    fn test_result_round_trip() {
        let m = sample(3, i64::MIN);
        let encoded = encode_result(&m);
        assert_eq!(ResultDecoder::new(16).decode(&encoded), Ok(Some(m)));
    }

    #[test]
    fn test_result_decoder_error_reply() {
        let encoded = encode_error("compute", "integer overflow at (0, 0)");
        assert_eq!(
            ResultDecoder::new(16).decode(&encoded),
            Err(ProtocolError::ErrorReply(
                "compute: integer overflow at (0, 0)".to_string()
            ))
        );
    }

    #[test]
    fn test_encode_error_flattens_newlines() {
        let encoded = encode_error("protocol", "bad\r\nline");
        assert_eq!(&encoded[..], b"ERROR protocol: bad  line\r\n");
    }
}
