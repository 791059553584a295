//! [`Response`] with [`Body`](crate::body::Body) as the default payload.

use crate::body::Body;

pub type Response<B = Body> = http::Response<B>;
