//! Shared test fixture: a bank account aggregate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use eventum::{EventSource, EventSourced, HandleEvents, HandlerTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCreatedEvent {
    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
    pub initial_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddressChangedEvent {
    pub previous_email_address: String,
    pub new_email_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountCreditedEvent {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDebitedEvent {
    pub amount: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum AccountError {
    #[error("invalid email address")]
    InvalidEmailAddress,
    #[error("amount must be positive")]
    NonPositiveAmount,
    #[error("negative balance not supported")]
    InsufficientFunds,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde(skip)]
    base: EventSource,

    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
    pub balance: f64,
}

impl Account {
    pub fn new(
        first_name: &str,
        last_name: &str,
        email_address: &str,
        initial_balance: f64,
    ) -> Self {
        let mut account = Account {
            base: EventSource::new::<Account>(),
            ..Default::default()
        };
        account.update(AccountCreatedEvent {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email_address: email_address.to_string(),
            initial_balance,
        });
        account
    }

    pub fn change_email_address(&mut self, new_email_address: &str) -> Result<(), AccountError> {
        if new_email_address.is_empty() {
            return Err(AccountError::InvalidEmailAddress);
        }
        self.update(EmailAddressChangedEvent {
            previous_email_address: self.email_address.clone(),
            new_email_address: new_email_address.to_string(),
        });
        Ok(())
    }

    pub fn credit(&mut self, amount: f64) -> Result<(), AccountError> {
        if amount <= 0.0 {
            return Err(AccountError::NonPositiveAmount);
        }
        self.update(AccountCreditedEvent { amount });
        Ok(())
    }

    pub fn debit(&mut self, amount: f64) -> Result<(), AccountError> {
        if amount <= 0.0 {
            return Err(AccountError::NonPositiveAmount);
        }
        if self.balance - amount < 0.0 {
            return Err(AccountError::InsufficientFunds);
        }
        self.update(AccountDebitedEvent { amount });
        Ok(())
    }

    fn apply_created(&mut self, event: &AccountCreatedEvent) {
        self.first_name = event.first_name.clone();
        self.last_name = event.last_name.clone();
        self.email_address = event.email_address.clone();
        self.balance = event.initial_balance;
    }

    fn apply_email_changed(&mut self, event: &EmailAddressChangedEvent) {
        self.email_address = event.new_email_address.clone();
    }

    fn apply_credited(&mut self, event: &AccountCreditedEvent) {
        self.balance += event.amount;
    }

    fn apply_debited(&mut self, event: &AccountDebitedEvent) {
        self.balance -= event.amount;
    }
}

impl EventSourced for Account {
    fn event_source(&self) -> &EventSource {
        &self.base
    }

    fn event_source_mut(&mut self) -> &mut EventSource {
        &mut self.base
    }
}

impl HandleEvents for Account {
    fn handler_table() -> HandlerTable {
        HandlerTable::new::<Account>()
            .on(Account::apply_created)
            .on(Account::apply_email_changed)
            .on(Account::apply_credited)
            .on(Account::apply_debited)
    }
}
