use std::io::ErrorKind;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::{EncryptedReader, EncryptedWriter, CIPHERTEXT_OVERHEAD, MAX_CHUNK_SIZE, NONCE_SIZE};

async fn encrypt(key: &[u8; 32], msgs: &[&[u8]]) -> Vec<u8> {
    let mut writer = EncryptedWriter::new(Vec::new(), key).await.unwrap();
    for msg in msgs {
        writer.write_all(msg).await.unwrap();
        writer.flush().await.unwrap();
    }
    writer.shutdown().await.unwrap();
    writer.into_inner()
}

#[tokio::test]
async fn test_all() {
    let key: [u8; 32] = rand::random();
    let (read_stream, write_stream) = tokio::io::duplex(100);
    let mut buf = vec![0u8; 3];
    let mut writer = EncryptedWriter::new(write_stream, &key).await.unwrap();
    let mut reader = EncryptedReader::new(read_stream, &key).await.unwrap();

    let test_data = [b"abc", b"def", b"ghi", b"jkl", b"mno", b"prs", b"tuw", b"yzz"];

    for msg in test_data {
        writer.write_all(msg).await.unwrap();
        writer.flush().await.unwrap();
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, msg[..]);
    }
}

#[tokio::test]
async fn flush_seals_everything_written() {
    let key: [u8; 32] = rand::random();
    let ciphertext = encrypt(&key, &[b"hello", b"world"]).await;

    // nonce, then two chunks of (length, plaintext, tag)
    assert_eq!(ciphertext.len(), NONCE_SIZE + 2 * (4 + CIPHERTEXT_OVERHEAD) + 10);

    let mut reader = EncryptedReader::new(&ciphertext[..], &key).await.unwrap();
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).await.unwrap();
    assert_eq!(plaintext, b"helloworld");
}

#[tokio::test]
async fn large_payload_spans_chunks() {
    let key: [u8; 32] = rand::random();
    let payload: Vec<u8> = (0..MAX_CHUNK_SIZE * 3 + 77).map(|i| (i % 251) as u8).collect();
    let ciphertext = encrypt(&key, &[&payload]).await;

    assert_eq!(
        ciphertext.len(),
        NONCE_SIZE + 4 * (4 + CIPHERTEXT_OVERHEAD) + payload.len()
    );

    let mut reader = EncryptedReader::new(&ciphertext[..], &key).await.unwrap();
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).await.unwrap();
    assert_eq!(plaintext, payload);
}

#[tokio::test]
async fn buf_read_lines() {
    let key: [u8; 32] = rand::random();
    let ciphertext = encrypt(&key, &[b"first\nsec", b"ond\nthird"]).await;

    let reader = EncryptedReader::new(&ciphertext[..], &key).await.unwrap();
    let mut lines = reader.lines();
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first"));
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("second"));
    assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("third"));
    assert_eq!(lines.next_line().await.unwrap(), None);
}

#[tokio::test]
async fn empty_stream() {
    let key: [u8; 32] = rand::random();
    let ciphertext = encrypt(&key, &[]).await;
    assert_eq!(ciphertext.len(), NONCE_SIZE);

    let mut reader = EncryptedReader::new(&ciphertext[..], &key).await.unwrap();
    let mut plaintext = Vec::new();
    assert_eq!(reader.read_to_end(&mut plaintext).await.unwrap(), 0);
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let key: [u8; 32] = rand::random();
    let other_key: [u8; 32] = rand::random();
    let ciphertext = encrypt(&key, &[b"secret"]).await;

    let mut reader = EncryptedReader::new(&ciphertext[..], &other_key).await.unwrap();
    let mut plaintext = Vec::new();
    let err = reader.read_to_end(&mut plaintext).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[tokio::test]
async fn tampering_is_rejected() {
    let key: [u8; 32] = rand::random();
    let mut ciphertext = encrypt(&key, &[b"secret"]).await;
    let last = ciphertext.len() - 1;
    ciphertext[last] ^= 1;

    let mut reader = EncryptedReader::new(&ciphertext[..], &key).await.unwrap();
    let mut plaintext = Vec::new();
    let err = reader.read_to_end(&mut plaintext).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[tokio::test]
async fn truncation_is_rejected() {
    let key: [u8; 32] = rand::random();
    let ciphertext = encrypt(&key, &[b"secret"]).await;
    let truncated = &ciphertext[..ciphertext.len() - 3];

    let mut reader = EncryptedReader::new(truncated, &key).await.unwrap();
    let mut plaintext = Vec::new();
    let err = reader.read_to_end(&mut plaintext).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);

    let err = EncryptedReader::new(&ciphertext[..3], &key).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
}
