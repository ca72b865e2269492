// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::borrow::Cow;

use futures::future::Either;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::http::{HttpError, HttpHeadTransform};
use super::quota::{QuotaError, QuotaMeter};

const PIPE_BUFFER_CAPACITY: usize = 1024 * 32;

#[derive(thiserror::Error, Debug)]
pub enum PipeError {
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Http(#[from] HttpError),
  #[error(transparent)]
  Quota(#[from] QuotaError),
}

/// Copies `reader` into `writer` until end of stream, then shuts `writer` down
///
/// Each chunk is metered before it is forwarded and may be rewritten by `transform`.
#[tracing::instrument(level = "trace", skip_all, err(Debug, level = "debug"))]
pub async fn pipe<R, W>(
  reader: &mut R,
  writer: &mut W,
  mut transform: Option<&mut HttpHeadTransform>,
  quota: Option<&QuotaMeter>,
) -> Result<u64, PipeError>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  let mut buffer = vec![0u8; PIPE_BUFFER_CAPACITY];
  let mut forwarded = 0u64;
  loop {
    let read = reader.read(&mut buffer).await?;
    if read == 0 {
      break;
    }
    if let Some(quota) = quota {
      quota.record(read).await?;
    }
    let chunk = &buffer[..read];
    let out = match transform.as_deref_mut() {
      Some(transform) => transform.transform(chunk)?,
      None => Cow::Borrowed(chunk),
    };
    if !out.is_empty() {
      writer.write_all(&out).await?;
      writer.flush().await?;
      forwarded += out.len() as u64;
    }
  }
  if let Some(transform) = transform {
    let held = transform.finish();
    if !held.is_empty() {
      writer.write_all(&held).await?;
      forwarded += held.len() as u64;
    }
  }
  writer.shutdown().await?;
  Ok(forwarded)
}

/// Transforms and metering applied while splicing two sockets
#[derive(Default)]
pub struct SpliceOptions<'a> {
  pub request: Option<HttpHeadTransform>,
  pub response: Option<HttpHeadTransform>,
  pub quota: Option<&'a QuotaMeter>,
}

/// Wires `client` to `server` in both directions
///
/// The exchange is over once the server side has finished answering: a client that half-closes
/// only ends the request direction, but the end of the response direction ends both.
pub async fn splice<C, S>(
  client: &mut C,
  server: &mut S,
  options: SpliceOptions<'_>,
) -> Result<(), PipeError>
where
  C: AsyncRead + AsyncWrite + Unpin + ?Sized,
  S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  let SpliceOptions {
    mut request,
    mut response,
    quota,
  } = options;
  let (mut client_reader, mut client_writer) = tokio::io::split(client);
  let (mut server_reader, mut server_writer) = tokio::io::split(server);
  let requests = pipe(
    &mut client_reader,
    &mut server_writer,
    request.as_mut(),
    quota,
  );
  let responses = pipe(
    &mut server_reader,
    &mut client_writer,
    response.as_mut(),
    quota,
  );
  futures::pin_mut!(requests, responses);
  match futures::future::select(requests, responses).await {
    Either::Left((Ok(sent), responses)) => {
      let received = responses.await?;
      tracing::trace!(sent, received, "Exchange complete");
      Ok(())
    }
    Either::Right((Ok(received), _)) => {
      tracing::trace!(received, "Exchange answered");
      Ok(())
    }
    Either::Left((Err(error), _)) | Either::Right((Err(error), _)) => Err(error),
  }
}
