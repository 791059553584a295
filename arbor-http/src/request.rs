//! [`Request`] with [`Body`](crate::body::Body) as the default payload.

use crate::body::Body;

pub type Request<B = Body> = http::Request<B>;
