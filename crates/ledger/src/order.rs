use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use agritrace_core::{BatchId, Entity, LedgerError, LedgerResult, OrderId, PartyId, Quantity};

/// One requested basket line, as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRequest {
    pub batch_id: BatchId,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

/// A basket line whose quantity, price and total have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedLine {
    pub batch_id: BatchId,
    pub quantity: Quantity,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// Sum of money amounts; overflow is a validation error.
fn checked_total(amounts: impl IntoIterator<Item = Decimal>) -> LedgerResult<Decimal> {
    amounts.into_iter().try_fold(Decimal::ZERO, |acc, amount| {
        acc.checked_add(amount)
            .ok_or_else(|| LedgerError::validation("order total is out of range"))
    })
}

/// Shape checks that need no stored state: a non-empty basket with positive
/// quantities and prices whose line and basket totals are representable.
pub fn validate_basket(items: &[LineItemRequest]) -> LedgerResult<Vec<ValidatedLine>> {
    if items.is_empty() {
        return Err(LedgerError::validation("order must contain at least one item"));
    }

    let lines = items
        .iter()
        .map(|item| {
            let quantity = Quantity::positive(item.quantity)?;
            if item.unit_price <= Decimal::ZERO {
                return Err(LedgerError::validation(format!(
                    "unit price for batch {} must be greater than zero",
                    item.batch_id
                )));
            }
            let line_total = quantity.value().checked_mul(item.unit_price).ok_or_else(|| {
                LedgerError::validation(format!(
                    "line total for batch {} is out of range",
                    item.batch_id
                ))
            })?;
            Ok(ValidatedLine {
                batch_id: item.batch_id,
                quantity,
                unit_price: item.unit_price,
                line_total,
            })
        })
        .collect::<LedgerResult<Vec<_>>>()?;

    checked_total(lines.iter().map(|l| l.line_total))?;
    Ok(lines)
}

/// Total requested per source batch, ordered by batch id (lock order).
pub fn requested_per_batch(lines: &[ValidatedLine]) -> LedgerResult<BTreeMap<BatchId, Quantity>> {
    let mut totals = BTreeMap::new();
    for line in lines {
        let entry = totals.entry(line.batch_id).or_insert(Quantity::ZERO);
        *entry = entry.checked_add(line.quantity)?;
    }
    Ok(totals)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub source_batch_id: BatchId,
    pub downstream_batch_id: BatchId,
    pub quantity: Quantity,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

/// A purchase from a single seller, fulfilled by downstream batches owned by
/// the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub buyer: PartyId,
    pub seller: PartyId,
    pub lines: Vec<OrderLine>,
    pub total_amount: Decimal,
    pub transporter: Option<PartyId>,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Order {
    pub fn place(
        id: OrderId,
        order_number: String,
        buyer: PartyId,
        seller: PartyId,
        lines: Vec<OrderLine>,
        created_at: DateTime<Utc>,
    ) -> LedgerResult<Order> {
        if lines.is_empty() {
            return Err(LedgerError::validation("order must contain at least one item"));
        }
        let total_amount = checked_total(lines.iter().map(|l| l.line_total))?;

        Ok(Order {
            id,
            order_number,
            buyer,
            seller,
            lines,
            total_amount,
            transporter: None,
            is_completed: false,
            created_at,
            completed_at: None,
        })
    }

    pub fn downstream_batch_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<_> = self.lines.iter().map(|l| l.downstream_batch_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn ensure_open(&self) -> LedgerResult<()> {
        if self.is_completed {
            return Err(LedgerError::validation(format!(
                "order {} is already completed",
                self.order_number
            )));
        }
        Ok(())
    }

    pub fn assign_transporter(&mut self, transporter: PartyId) -> LedgerResult<()> {
        self.ensure_open()?;
        match self.transporter {
            Some(current) if current != transporter => Err(LedgerError::validation(format!(
                "order {} is already assigned to another transporter",
                self.order_number
            ))),
            _ => {
                self.transporter = Some(transporter);
                Ok(())
            }
        }
    }

    pub fn complete(&mut self, at: DateTime<Utc>) -> LedgerResult<()> {
        self.ensure_open()?;
        self.is_completed = true;
        self.completed_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_line(source: BatchId, quantity: Decimal, price: Decimal) -> OrderLine {
        OrderLine {
            source_batch_id: source,
            downstream_batch_id: BatchId::new(),
            quantity: Quantity::positive(quantity).unwrap(),
            unit_price: price,
            line_total: quantity * price,
        }
    }

    #[test]
    fn empty_basket_is_rejected() {
        assert!(matches!(validate_basket(&[]), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let items = [LineItemRequest {
            batch_id: BatchId::new(),
            quantity: dec!(1),
            unit_price: dec!(0),
        }];
        assert!(matches!(validate_basket(&items), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn repeated_batches_are_aggregated() {
        let a = BatchId::new();
        let b = BatchId::new();
        let lines = validate_basket(&[
            LineItemRequest { batch_id: a, quantity: dec!(2), unit_price: dec!(1.5) },
            LineItemRequest { batch_id: b, quantity: dec!(1), unit_price: dec!(3) },
            LineItemRequest { batch_id: a, quantity: dec!(0.5), unit_price: dec!(1.5) },
        ])
        .unwrap();

        let totals = requested_per_batch(&lines).unwrap();
        assert_eq!(totals[&a], Quantity::positive(dec!(2.5)).unwrap());
        assert_eq!(totals[&b], Quantity::positive(dec!(1)).unwrap());
        assert_eq!(lines[0].line_total, dec!(3.0));
    }

    #[test]
    fn line_totals_past_the_decimal_range_are_rejected() {
        let items = [LineItemRequest {
            batch_id: BatchId::new(),
            quantity: dec!(1000),
            unit_price: Decimal::MAX / dec!(10),
        }];
        assert!(matches!(validate_basket(&items), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn basket_totals_past_the_decimal_range_are_rejected() {
        let batch_id = BatchId::new();
        let line = LineItemRequest {
            batch_id,
            quantity: dec!(1),
            unit_price: Decimal::MAX / dec!(2) + dec!(1),
        };
        let err = validate_basket(&[line.clone(), line]).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn requested_quantities_past_the_decimal_range_are_rejected() {
        let batch_id = BatchId::new();
        let huge = Quantity::positive(Decimal::MAX / dec!(2) + dec!(1)).unwrap();
        let line = ValidatedLine {
            batch_id,
            quantity: huge,
            unit_price: dec!(0.000001),
            line_total: dec!(1),
        };
        assert!(matches!(
            requested_per_batch(&[line.clone(), line]),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn order_total_is_the_sum_of_lines() {
        let source = BatchId::new();
        let order = Order::place(
            OrderId::new(),
            "ORD-1".into(),
            PartyId::new(),
            PartyId::new(),
            vec![test_line(source, dec!(2), dec!(3.25)), test_line(source, dec!(1), dec!(10))],
            Utc::now(),
        )
        .unwrap();

        assert_eq!(order.total_amount, dec!(16.50));
        assert!(!order.is_completed);
        assert_eq!(order.downstream_batch_ids().len(), 2);
    }

    #[test]
    fn completion_happens_once() {
        let mut order = Order::place(
            OrderId::new(),
            "ORD-2".into(),
            PartyId::new(),
            PartyId::new(),
            vec![test_line(BatchId::new(), dec!(1), dec!(1))],
            Utc::now(),
        )
        .unwrap();

        order.complete(Utc::now()).unwrap();
        assert!(order.is_completed);
        assert!(matches!(order.complete(Utc::now()), Err(LedgerError::Validation(_))));
        assert!(order.assign_transporter(PartyId::new()).is_err());
    }

    #[test]
    fn transporter_cannot_be_swapped() {
        let mut order = Order::place(
            OrderId::new(),
            "ORD-3".into(),
            PartyId::new(),
            PartyId::new(),
            vec![test_line(BatchId::new(), dec!(1), dec!(1))],
            Utc::now(),
        )
        .unwrap();
        let first = PartyId::new();

        order.assign_transporter(first).unwrap();
        order.assign_transporter(first).unwrap();
        assert!(order.assign_transporter(PartyId::new()).is_err());
    }
}
