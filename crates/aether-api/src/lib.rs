//! C8 API/RPC protocol: method-id dispatch, sub-API embedding, correlation
//! ids for `ApiPromisePtr<T>`, and the concrete work-cloud/work-server API
//! shapes (`spec.md` §4.6, §6).

pub mod client_api_safe;
pub mod correlation;
pub mod error;
pub mod method;
pub mod work_cloud;
pub mod work_server_api;

pub use client_api_safe::ClientApiSafe;
pub use correlation::{ApiPromise, ProtocolContext};
pub use error::{ApiError, ApiResult};
pub use method::ApiDispatch;
pub use work_server_api::{AuthorizedApi, LoginApi};
