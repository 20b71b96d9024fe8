use bytes::Bytes;
use std::fmt;
use std::fmt::Write;
use std::ops::Deref;

/// A request body.
#[derive(Clone, Default, PartialEq)]
pub struct Body {
  pub(crate) inner: Bytes,
}

impl Body {
  /// Byte length of the body.
  pub fn len(&self) -> usize {
    self.inner.len()
  }

  /// Whether the body is empty.
  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Display::fmt(s, f),
      Err(_) => fmt::Display::fmt(
        &self.inner.iter().fold(String::new(), |mut out, b| {
          let _ = write!(out, "\\x{b:02x}");
          out
        }),
        f,
      ),
    }
  }
}
