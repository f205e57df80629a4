//! 执行监管：每个执行一个取消令牌
//!
//! 根令牌在进程关闭时取消；每次运行拿到根令牌的子令牌，cancel(execution_id) 只影响该次运行。

use std::collections::HashMap;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ExecutionSupervisor {
    root: CancellationToken,
    tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl ExecutionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// 注册执行并返回其令牌；重复注册（resume）复用未取消的旧令牌
    pub fn register(&self, execution_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        match tokens.get(execution_id) {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = self.root.child_token();
                tokens.insert(execution_id.to_string(), token.clone());
                token
            }
        }
    }

    /// 取消单个执行；未注册时返回 false
    pub fn cancel(&self, execution_id: &str) -> bool {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        match tokens.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, execution_id: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(execution_id);
    }

    pub fn is_cancelled(&self, execution_id: &str) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(execution_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// 取消全部运行（进程关闭）
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Default for ExecutionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
