//! Integrations that rely on third-party services.
//!
//! Currently the captcha solving vendors used by the browser search flow.

pub mod captcha;

pub use captcha::{
    CapSolverProvider, CaptchaConfig, CaptchaError, CaptchaKind, CaptchaProvider, CaptchaSolution,
    CaptchaTask, TwoCaptchaProvider,
};
