use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default, Display)]
#[db_enum(pg_type = "token_status_enum")]
#[db_enum(value_style = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    #[default]
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default, Display)]
#[db_enum(pg_type = "channel_status_enum")]
#[db_enum(value_style = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

/// Upstream provider kinds. Discriminants are the codes persisted in `channels.channel_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[repr(i32)]
pub enum ChannelType {
    Unknown = 0,
    OpenAI = 1,
    API2D = 2,
    Azure = 3,
    CloseAI = 4,
    OpenAISB = 5,
    OpenAIMax = 6,
    OhMyGPT = 7,
    Custom = 8,
    Ails = 9,
    AIProxy = 10,
    PaLM = 11,
    API2GPT = 12,
    AIGC2D = 13,
    Anthropic = 14,
    Baidu = 15,
    Zhipu = 16,
    Ali = 17,
    Xunfei = 18,
    AI360 = 19,
    OpenRouter = 20,
    AIProxyLibrary = 21,
    FastGPT = 22,
    Tencent = 23,
    Gemini = 24,
    Moonshot = 25,
    Baichuan = 26,
    Minimax = 27,
    Mistral = 28,
    Groq = 29,
    Ollama = 30,
    LingYiWanWu = 31,
    StepFun = 32,
    AwsClaude = 33,
    Coze = 34,
    Cohere = 35,
    DeepSeek = 36,
    Cloudflare = 37,
    DeepL = 38,
    TogetherAI = 39,
    Doubao = 40,
    Novita = 41,
    VertexAI = 42,
    Proxy = 43,
    SiliconFlow = 44,
    XAI = 45,
    Replicate = 46,
    BaiduV2 = 47,
    XunfeiV2 = 48,
    AliBailian = 49,
    OpenAICompatible = 50,
    GeminiOpenAICompatible = 51,
}

impl ChannelType {
    const ALL: [ChannelType; 52] = [
        ChannelType::Unknown,
        ChannelType::OpenAI,
        ChannelType::API2D,
        ChannelType::Azure,
        ChannelType::CloseAI,
        ChannelType::OpenAISB,
        ChannelType::OpenAIMax,
        ChannelType::OhMyGPT,
        ChannelType::Custom,
        ChannelType::Ails,
        ChannelType::AIProxy,
        ChannelType::PaLM,
        ChannelType::API2GPT,
        ChannelType::AIGC2D,
        ChannelType::Anthropic,
        ChannelType::Baidu,
        ChannelType::Zhipu,
        ChannelType::Ali,
        ChannelType::Xunfei,
        ChannelType::AI360,
        ChannelType::OpenRouter,
        ChannelType::AIProxyLibrary,
        ChannelType::FastGPT,
        ChannelType::Tencent,
        ChannelType::Gemini,
        ChannelType::Moonshot,
        ChannelType::Baichuan,
        ChannelType::Minimax,
        ChannelType::Mistral,
        ChannelType::Groq,
        ChannelType::Ollama,
        ChannelType::LingYiWanWu,
        ChannelType::StepFun,
        ChannelType::AwsClaude,
        ChannelType::Coze,
        ChannelType::Cohere,
        ChannelType::DeepSeek,
        ChannelType::Cloudflare,
        ChannelType::DeepL,
        ChannelType::TogetherAI,
        ChannelType::Doubao,
        ChannelType::Novita,
        ChannelType::VertexAI,
        ChannelType::Proxy,
        ChannelType::SiliconFlow,
        ChannelType::XAI,
        ChannelType::Replicate,
        ChannelType::BaiduV2,
        ChannelType::XunfeiV2,
        ChannelType::AliBailian,
        ChannelType::OpenAICompatible,
        ChannelType::GeminiOpenAICompatible,
    ];

    pub fn from_code(code: i32) -> ChannelType {
        usize::try_from(code)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .unwrap_or(ChannelType::Unknown)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Base URL used when the channel carries no override. Empty means the
    /// channel must provide its own.
    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::OpenAI => "https://api.openai.com",
            ChannelType::API2D => "https://oa.api2d.net",
            ChannelType::CloseAI => "https://api.closeai-proxy.xyz",
            ChannelType::OpenAISB => "https://api.openai-sb.com",
            ChannelType::OpenAIMax => "https://api.openaimax.com",
            ChannelType::OhMyGPT => "https://api.ohmygpt.com",
            ChannelType::Ails => "https://api.caipacity.com",
            ChannelType::AIProxy => "https://api.aiproxy.io",
            ChannelType::PaLM => "https://generativelanguage.googleapis.com",
            ChannelType::API2GPT => "https://api.api2gpt.com",
            ChannelType::AIGC2D => "https://api.aigc2d.com",
            ChannelType::Anthropic => "https://api.anthropic.com",
            ChannelType::Baidu => "https://aip.baidubce.com",
            ChannelType::Zhipu => "https://open.bigmodel.cn",
            ChannelType::Ali => "https://dashscope.aliyuncs.com",
            ChannelType::AI360 => "https://ai.360.cn",
            ChannelType::OpenRouter => "https://openrouter.ai/api",
            ChannelType::AIProxyLibrary => "https://api.aiproxy.io",
            ChannelType::FastGPT => "https://fastgpt.run/api/openapi",
            ChannelType::Tencent => "https://hunyuan.tencentcloudapi.com",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com",
            ChannelType::Moonshot => "https://api.moonshot.cn",
            ChannelType::Baichuan => "https://api.baichuan-ai.com",
            ChannelType::Minimax => "https://api.minimax.chat",
            ChannelType::Mistral => "https://api.mistral.ai",
            ChannelType::Groq => "https://api.groq.com/openai",
            ChannelType::Ollama => "http://localhost:11434",
            ChannelType::LingYiWanWu => "https://api.lingyiwanwu.com",
            ChannelType::StepFun => "https://api.stepfun.com",
            ChannelType::Coze => "https://api.coze.com",
            ChannelType::Cohere => "https://api.cohere.ai",
            ChannelType::DeepSeek => "https://api.deepseek.com",
            ChannelType::Cloudflare => "https://api.cloudflare.com",
            ChannelType::DeepL => "https://api-free.deepl.com",
            ChannelType::TogetherAI => "https://api.together.xyz",
            ChannelType::Doubao => "https://ark.cn-beijing.volces.com",
            ChannelType::Novita => "https://api.novita.ai/v3/openai",
            ChannelType::SiliconFlow => "https://api.siliconflow.cn",
            ChannelType::XAI => "https://api.x.ai",
            ChannelType::Replicate => "https://api.replicate.com/v1/models/",
            ChannelType::BaiduV2 => "https://qianfan.baidubce.com",
            ChannelType::XunfeiV2 => "https://spark-api-open.xf-yun.com",
            ChannelType::AliBailian => "https://dashscope.aliyuncs.com",
            ChannelType::GeminiOpenAICompatible => "https://generativelanguage.googleapis.com/v1beta/openai",
            ChannelType::Unknown
            | ChannelType::Azure
            | ChannelType::Custom
            | ChannelType::Xunfei
            | ChannelType::AwsClaude
            | ChannelType::VertexAI
            | ChannelType::Proxy
            | ChannelType::OpenAICompatible => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_table() {
        for (idx, channel_type) in ChannelType::ALL.iter().enumerate() {
            assert_eq!(channel_type.code() as usize, idx);
            assert_eq!(ChannelType::from_code(channel_type.code()), *channel_type);
        }
    }

    #[test]
    fn unknown_codes_fall_back() {
        assert_eq!(ChannelType::from_code(-1), ChannelType::Unknown);
        assert_eq!(ChannelType::from_code(999), ChannelType::Unknown);
    }
}
