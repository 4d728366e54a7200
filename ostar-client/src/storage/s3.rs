//! S3 backend on top of the AWS SDK.
//!
//! The engine works with blocking readers and writers, so requests are driven on a tokio
//! runtime through its [`Handle`]. None of the methods may be called from within that runtime.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{format_err, Context, Error};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ServerSideEncryption as SdkEncryption,
};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;

use ostar_tools::io::WriteClose;

use super::{pipe, Backend, ObjectMetadata, PipeReader};
use crate::locator::{Reference, ReferenceKind};
use crate::tools::{content_type_for_key, S3Settings, ServerSideEncryption};

pub struct S3Backend {
    client: Client,
    handle: Handle,
    settings: Arc<S3Settings>,
}

impl S3Backend {
    /// Set up a client from the default AWS provider chain.
    pub fn new(handle: Handle, settings: S3Settings) -> Result<Self, Error> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(retries) = settings.max_retries {
            loader = loader.retry_config(
                aws_config::retry::RetryConfig::standard().with_max_attempts(retries.max(1)),
            );
        }
        let sdk_config = handle.block_on(loader.load());
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.path_style)
            .build();

        log::debug!("s3 backend ready ({:?})", settings);

        Ok(Self {
            client: Client::from_conf(config),
            handle,
            settings: Arc::new(settings),
        })
    }
}

fn check_object(reference: &Reference) -> Result<(), Error> {
    if reference.kind != ReferenceKind::ObjectStore {
        return Err(format_err!("{} is not an object reference", reference));
    }
    Ok(())
}

impl Backend for S3Backend {
    fn stat(&self, reference: &Reference) -> Result<u64, Error> {
        check_object(reference)?;
        let output = self
            .handle
            .block_on(
                self.client
                    .head_object()
                    .bucket(&reference.bucket)
                    .key(&reference.key)
                    .send(),
            )
            .with_context(|| format!("failed to stat {}", reference))?;
        Ok(output.content_length().unwrap_or(0).max(0) as u64)
    }

    fn open_read(&self, reference: &Reference) -> Result<(Box<dyn Read + Send>, Option<u64>), Error> {
        check_object(reference)?;
        let output = self
            .handle
            .block_on(
                self.client
                    .get_object()
                    .bucket(&reference.bucket)
                    .key(&reference.key)
                    .send(),
            )
            .with_context(|| format!("failed to get {}", reference))?;

        let size = output.content_length().map(|len| len.max(0) as u64);
        let reader = ObjectReader {
            body: output.body,
            handle: self.handle.clone(),
            buffer: Bytes::new(),
        };
        Ok((Box::new(reader), size))
    }

    fn open_write(
        &self,
        reference: &Reference,
        metadata: &ObjectMetadata,
    ) -> Result<Box<dyn WriteClose>, Error> {
        check_object(reference)?;

        let upload = Arc::new(Upload {
            client: self.client.clone(),
            settings: Arc::clone(&self.settings),
            bucket: reference.bucket.clone(),
            key: reference.key.clone(),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            content_type: content_type_for_key(&reference.key).map(str::to_string),
        });

        let (writer, mut reader) = pipe();
        self.handle.spawn(async move {
            let result = upload.run(&mut reader).await;
            reader.complete(result);
        });

        Ok(Box::new(writer))
    }
}

/// Blocking reader over an object body.
struct ObjectReader {
    body: ByteStream,
    handle: Handle,
    buffer: Bytes,
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.buffer.is_empty() {
            match self.handle.block_on(self.body.next()) {
                Some(Ok(chunk)) => self.buffer = chunk,
                Some(Err(err)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, err))
                }
                None => return Ok(0),
            }
        }
        let len = buf.len().min(self.buffer.len());
        let chunk = self.buffer.split_to(len);
        buf[..len].copy_from_slice(&chunk);
        Ok(len)
    }
}

fn encryption_params(encryption: &ServerSideEncryption) -> (Option<SdkEncryption>, Option<String>) {
    match encryption {
        ServerSideEncryption::None => (None, None),
        ServerSideEncryption::Aes256 => (Some(SdkEncryption::Aes256), None),
        ServerSideEncryption::Kms { key_id } => (Some(SdkEncryption::AwsKms), key_id.clone()),
    }
}

/// Read from the pipe until `pending` holds at least `limit` bytes. Returns true at the end
/// of the stream.
async fn fill(reader: &mut PipeReader, pending: &mut Vec<u8>, limit: usize) -> Result<bool, Error> {
    while pending.len() < limit {
        match reader.next_chunk().await? {
            Some(chunk) => pending.extend_from_slice(&chunk),
            None => return Ok(true),
        }
    }
    Ok(false)
}

/// Split off the next part, keeping the remainder in `pending`.
fn take_part(pending: &mut Vec<u8>, part_size: usize) -> Vec<u8> {
    let rest = if pending.len() > part_size {
        pending.split_off(part_size)
    } else {
        Vec::new()
    };
    std::mem::replace(pending, rest)
}

struct Upload {
    client: Client,
    settings: Arc<S3Settings>,
    bucket: String,
    key: String,
    metadata: HashMap<String, String>,
    content_type: Option<String>,
}

impl Upload {
    /// Objects smaller than one part are sent with a single request, everything else as
    /// multipart upload.
    async fn run(self: Arc<Self>, reader: &mut PipeReader) -> Result<(), Error> {
        let part_size = self.settings.part_size();
        let mut pending = Vec::with_capacity(part_size);

        if fill(reader, &mut pending, part_size).await? {
            return self.put_single(pending).await;
        }

        let upload_id = self.create_multipart().await?;
        match Arc::clone(&self)
            .upload_parts(reader, &upload_id, pending)
            .await
        {
            Ok(parts) => self.complete_multipart(&upload_id, parts).await,
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    log::warn!(
                        "failed to abort multipart upload of s3://{}/{} - {}",
                        self.bucket,
                        self.key,
                        abort_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn put_single(&self, data: Vec<u8>) -> Result<(), Error> {
        let (sse, kms_key_id) = encryption_params(&self.settings.encryption);
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(data))
            .set_content_type(self.content_type.clone())
            .set_metadata(Some(self.metadata.clone()))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key_id)
            .send()
            .await
            .with_context(|| format!("failed to upload s3://{}/{}", self.bucket, self.key))?;

        log::info!("uploaded s3://{}/{} ({} bytes)", self.bucket, self.key, size);
        Ok(())
    }

    async fn create_multipart(&self) -> Result<String, Error> {
        let (sse, kms_key_id) = encryption_params(&self.settings.encryption);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .set_content_type(self.content_type.clone())
            .set_metadata(Some(self.metadata.clone()))
            .set_server_side_encryption(sse)
            .set_ssekms_key_id(kms_key_id)
            .send()
            .await
            .with_context(|| {
                format!("failed to start upload of s3://{}/{}", self.bucket, self.key)
            })?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| format_err!("no upload id for s3://{}/{}", self.bucket, self.key))?;
        log::info!("started multipart upload of s3://{}/{}", self.bucket, self.key);
        Ok(upload_id.to_string())
    }

    async fn upload_parts(
        self: Arc<Self>,
        reader: &mut PipeReader,
        upload_id: &str,
        mut pending: Vec<u8>,
    ) -> Result<Vec<CompletedPart>, Error> {
        let part_size = self.settings.part_size();
        let mut in_flight = FuturesUnordered::new();
        let mut completed = Vec::new();
        let mut part_number = 0;
        let mut eof = false;

        loop {
            if !eof {
                eof = fill(reader, &mut pending, part_size).await?;
            }
            if pending.is_empty() {
                break;
            }
            let body = take_part(&mut pending, part_size);
            part_number += 1;

            while in_flight.len() >= self.settings.concurrency {
                if let Some(part) = in_flight.next().await {
                    completed.push(part??);
                }
            }
            in_flight.push(tokio::spawn(Arc::clone(&self).upload_part(
                upload_id.to_string(),
                part_number,
                body,
            )));
        }

        while let Some(part) = in_flight.next().await {
            completed.push(part??);
        }
        completed.sort_by_key(|part: &CompletedPart| part.part_number());
        Ok(completed)
    }

    async fn upload_part(
        self: Arc<Self>,
        upload_id: String,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<CompletedPart, Error> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .with_context(|| {
                format!(
                    "failed to upload part {} of s3://{}/{}",
                    part_number, self.bucket, self.key
                )
            })?;

        log::debug!("uploaded part {} of s3://{}/{}", part_number, self.bucket, self.key);

        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn complete_multipart(
        &self,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), Error> {
        let count = parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| {
                format!("failed to complete upload of s3://{}/{}", self.bucket, self.key)
            })?;

        log::info!(
            "uploaded s3://{}/{} in {} parts",
            self.bucket,
            self.key,
            count
        );
        Ok(())
    }
}
