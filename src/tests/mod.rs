mod support;

#[cfg(feature = "server")]
mod test_http;
