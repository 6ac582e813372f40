//! Route paths.

pub const GET_API_HEALTH: &str = "/api/health";

pub const POST_AUTH_REGISTER: &str = "/auth/register";
pub const POST_AUTH_VERIFY_EMAIL: &str = "/auth/verify-email";
pub const POST_AUTH_RESEND_VERIFICATION: &str = "/auth/resend-verification";
pub const POST_AUTH_LOGIN: &str = "/auth/login";
pub const POST_AUTH_REFRESH: &str = "/auth/refresh";
pub const POST_AUTH_FORGOT_PASSWORD: &str = "/auth/forgot-password";
pub const POST_AUTH_RESET_PASSWORD: &str = "/auth/reset-password";

pub const POST_AUTH_LOGOUT: &str = "/auth/logout";
pub const POST_AUTH_LOGOUT_ALL: &str = "/auth/logout-all";
pub const POST_AUTH_CHANGE_PASSWORD: &str = "/auth/change-password";
pub const POST_AUTH_SWITCH_TENANT: &str = "/auth/switch-tenant";
pub const GET_AUTH_ME: &str = "/auth/me";

pub const API_RECORDS_TABLE: &str = "/api/records/{table}";
pub const API_RECORDS_TABLE_ID: &str = "/api/records/{table}/{id}";
